use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ParseError;
use crate::scoring::types::{
    Connection, KeySignature, Measure, Note, Score, System, TimeSignature, TransposeInfo,
};

const DEFAULT_TEMPO: f64 = 120.0;

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct ParseOptions {
    /// Group measures into systems of this many measures when the document
    /// carries no explicit system breaks.
    pub measures_per_system: Option<usize>,
    /// Treat `<duration>` as already including its dots, as MusicXML
    /// exporters write it. Off: each `<dot>` extends the divisions-derived
    /// duration too.
    pub duration_includes_dots: bool,
}

pub fn midi_from_pitch(step: char, alter: i32, octave: i32) -> i32 {
    let base = match step {
        'C' => 0,
        'D' => 2,
        'E' => 4,
        'F' => 5,
        'G' => 7,
        'A' => 9,
        'B' => 11,
        _ => 0,
    };
    (octave + 1) * 12 + base + alter
}

/// Scientific pitch name as written: `C4`, `F#5`, `Bb3`.
pub fn pitch_name(step: char, alter: i32, octave: i32) -> String {
    let accidental = match alter {
        -2 => "bb",
        -1 => "b",
        1 => "#",
        2 => "##",
        _ => "",
    };
    format!("{}{}{}", step, accidental, octave)
}

fn type_beats(note_type: &str) -> Option<f64> {
    let beats = match note_type {
        "breve" => 8.0,
        "whole" => 4.0,
        "half" => 2.0,
        "quarter" => 1.0,
        "eighth" => 0.5,
        "16th" => 0.25,
        "32nd" => 0.125,
        "64th" => 0.0625,
        _ => return None,
    };
    Some(beats)
}

/// Each dot adds half of the value added before it: 1.5x, 1.75x, ...
fn dotted(beats: f64, dots: u32) -> f64 {
    let mut total = beats;
    let mut extra = beats / 2.0;
    for _ in 0..dots {
        total += extra;
        extra /= 2.0;
    }
    total
}

pub fn parse_musicxml(xml: &str) -> Result<Score, ParseError> {
    parse_musicxml_with(xml, &ParseOptions::default())
}

pub fn parse_musicxml_with(xml: &str, options: &ParseOptions) -> Result<Score, ParseError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut parser = MusicXmlParser {
        duration_includes_dots: options.duration_includes_dots,
        ..MusicXmlParser::default()
    };
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) => {
                parser.check_root(e)?;
                parser
                    .open_elements
                    .push(String::from_utf8_lossy(e.name().as_ref()).into_owned());
                parser.open(e, false)?;
            }
            Event::Empty(ref e) => {
                parser.check_root(e)?;
                parser.open(e, true)?;
            }
            Event::Text(e) => {
                if let Some(field) = parser.field.take() {
                    let text = e.unescape()?;
                    parser.text(field, text.trim());
                }
            }
            Event::End(ref e) => {
                parser.open_elements.pop();
                parser.close(e.name().as_ref())?;
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if let Some(unclosed) = parser.open_elements.last() {
        return Err(ParseError::Truncated(unclosed.clone()));
    }

    parser.finish(options)
}

/// Elements whose text content the parser reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Field {
    Divisions,
    Duration,
    Step,
    Alter,
    Octave,
    PerMinute,
    Fifths,
    Mode,
    Beats,
    BeatType,
    Chromatic,
    Diatonic,
    Title,
    Composer,
    Type,
    Staff,
    Voice,
    Stem,
    Accidental,
}

impl Field {
    fn from_tag(tag: &[u8]) -> Option<Self> {
        let field = match tag {
            b"divisions" => Field::Divisions,
            b"duration" => Field::Duration,
            b"step" => Field::Step,
            b"alter" => Field::Alter,
            b"octave" => Field::Octave,
            b"per-minute" => Field::PerMinute,
            b"fifths" => Field::Fifths,
            b"mode" => Field::Mode,
            b"beats" => Field::Beats,
            b"beat-type" => Field::BeatType,
            b"chromatic" => Field::Chromatic,
            b"diatonic" => Field::Diatonic,
            b"work-title" | b"movement-title" => Field::Title,
            b"type" => Field::Type,
            b"staff" => Field::Staff,
            b"voice" => Field::Voice,
            b"stem" => Field::Stem,
            b"accidental" => Field::Accidental,
            _ => return None,
        };
        Some(field)
    }
}

#[derive(Default)]
struct PendingNote {
    is_rest: bool,
    is_chord: bool,
    is_grace: bool,
    duration_divs: Option<f64>,
    note_type: Option<String>,
    dots: u32,
    step: Option<char>,
    alter: i32,
    octave: Option<i32>,
    staff: Option<u8>,
    voice: Option<u8>,
    stem: Option<String>,
    accidental: Option<String>,
    tie: Option<Connection>,
    slur: Option<Connection>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Motion {
    Backup,
    Forward,
}

struct OpenMeasure {
    number: u32,
    start_beat: f64,
    system_index: usize,
    notes: Vec<Note>,
}

struct MusicXmlParser {
    open_elements: Vec<String>,
    root_checked: bool,
    field: Option<Field>,

    // Score-level metadata
    title: Option<String>,
    composer: Option<String>,
    tempo: Option<f64>,
    key: KeySignature,
    time: TimeSignature,
    divisions: f64,
    transpose: Option<TransposeInfo>,
    in_transpose: bool,
    pending_transpose: TransposeInfo,

    // Only the first part is read
    parts_seen: u32,
    skipping_part: bool,

    // Running clock, in beats
    clock: f64,
    last_onset: f64,
    measure_extent: f64,

    note: Option<PendingNote>,
    motion: Option<(Motion, f64)>,
    measure: Option<OpenMeasure>,
    measures: Vec<Measure>,

    current_system: usize,
    explicit_breaks: bool,
    duration_includes_dots: bool,
}

impl Default for MusicXmlParser {
    fn default() -> Self {
        MusicXmlParser {
            open_elements: Vec::new(),
            root_checked: false,
            field: None,
            title: None,
            composer: None,
            tempo: None,
            key: KeySignature::default(),
            time: TimeSignature::default(),
            divisions: 1.0,
            transpose: None,
            in_transpose: false,
            pending_transpose: TransposeInfo {
                chromatic: 0,
                diatonic: 0,
            },
            parts_seen: 0,
            skipping_part: false,
            clock: 0.0,
            last_onset: 0.0,
            measure_extent: 0.0,
            note: None,
            motion: None,
            measure: None,
            measures: Vec::new(),
            current_system: 0,
            explicit_breaks: false,
            duration_includes_dots: false,
        }
    }
}

fn attr_value(e: &BytesStart, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == key)
        .and_then(|a| std::str::from_utf8(&a.value).ok().map(str::to_string))
}

impl MusicXmlParser {
    fn check_root(&mut self, e: &BytesStart) -> Result<(), ParseError> {
        if self.root_checked {
            return Ok(());
        }
        self.root_checked = true;
        let name = e.name();
        if name.as_ref() != b"score-partwise" {
            return Err(ParseError::UnsupportedRoot(
                String::from_utf8_lossy(name.as_ref()).into_owned(),
            ));
        }
        Ok(())
    }

    fn open(&mut self, e: &BytesStart, empty: bool) -> Result<(), ParseError> {
        let name = e.name();
        let tag = name.as_ref();

        if tag == b"part" {
            self.parts_seen += 1;
            self.skipping_part = self.parts_seen > 1 && !empty;
            return Ok(());
        }
        if self.skipping_part {
            return Ok(());
        }

        match tag {
            b"measure" => {
                let number = attr_value(e, b"number").and_then(|v| v.trim().parse::<u32>().ok());
                self.start_measure(number);
            }
            b"print" => {
                let breaks = ["new-system", "new-page"]
                    .iter()
                    .any(|k| attr_value(e, k.as_bytes()).as_deref() == Some("yes"));
                if breaks {
                    self.system_break();
                }
            }
            b"note" => self.note = Some(PendingNote::default()),
            b"rest" | b"unpitched" => {
                if let Some(note) = self.note.as_mut() {
                    note.is_rest = true;
                }
            }
            b"chord" => {
                if let Some(note) = self.note.as_mut() {
                    note.is_chord = true;
                }
            }
            b"grace" | b"cue" => {
                if let Some(note) = self.note.as_mut() {
                    note.is_grace = true;
                }
            }
            b"dot" => {
                if let Some(note) = self.note.as_mut() {
                    note.dots += 1;
                }
            }
            b"tie" => {
                if let Some(note) = self.note.as_mut() {
                    let kind = attr_value(e, b"type").and_then(|v| Connection::from_attr(&v));
                    note.tie = match (note.tie, kind) {
                        (Some(Connection::Stop), Some(Connection::Start)) => {
                            Some(Connection::Continue)
                        }
                        (existing, None) => existing,
                        (_, kind) => kind,
                    };
                }
            }
            b"slur" => {
                if let Some(note) = self.note.as_mut() {
                    if let Some(kind) = attr_value(e, b"type").and_then(|v| Connection::from_attr(&v)) {
                        note.slur = Some(kind);
                    }
                }
            }
            b"backup" => self.motion = Some((Motion::Backup, 0.0)),
            b"forward" => self.motion = Some((Motion::Forward, 0.0)),
            b"transpose" => {
                self.in_transpose = true;
                self.pending_transpose = TransposeInfo {
                    chromatic: 0,
                    diatonic: 0,
                };
            }
            b"creator" => {
                if !empty && attr_value(e, b"type").as_deref() == Some("composer") {
                    self.field = Some(Field::Composer);
                }
            }
            b"sound" => {
                if let Some(t) = attr_value(e, b"tempo").and_then(|v| v.parse::<f64>().ok()) {
                    self.set_tempo(t);
                }
            }
            _ => {
                if !empty {
                    self.field = Field::from_tag(tag);
                }
            }
        }
        Ok(())
    }

    fn text(&mut self, field: Field, text: &str) {
        match field {
            Field::Divisions => {
                if let Ok(v) = text.parse::<f64>() {
                    if v > 0.0 {
                        self.divisions = v;
                    }
                }
            }
            Field::Duration => {
                if let Ok(v) = text.parse::<f64>() {
                    if let Some(note) = self.note.as_mut() {
                        note.duration_divs = Some(v);
                    } else if let Some((_, divs)) = self.motion.as_mut() {
                        *divs = v;
                    }
                }
            }
            Field::Step => {
                if let Some(note) = self.note.as_mut() {
                    note.step = text.chars().next().map(|c| c.to_ascii_uppercase());
                }
            }
            Field::Alter => {
                if let (Some(note), Ok(v)) = (self.note.as_mut(), text.parse::<f64>()) {
                    note.alter = v.round() as i32;
                }
            }
            Field::Octave => {
                if let (Some(note), Ok(v)) = (self.note.as_mut(), text.parse::<i32>()) {
                    note.octave = Some(v);
                }
            }
            Field::PerMinute => {
                if let Ok(v) = text.parse::<f64>() {
                    self.set_tempo(v);
                }
            }
            Field::Fifths => {
                if let Ok(v) = text.parse::<i32>() {
                    self.key.fifths = v;
                }
            }
            Field::Mode => self.key.mode = text.to_string(),
            Field::Beats => {
                if let Ok(v) = text.parse::<u8>() {
                    self.time.beats = v;
                }
            }
            Field::BeatType => {
                if let Ok(v) = text.parse::<u8>() {
                    if v > 0 {
                        self.time.beat_type = v;
                    }
                }
            }
            Field::Chromatic => {
                if let (true, Ok(v)) = (self.in_transpose, text.parse::<i32>()) {
                    self.pending_transpose.chromatic = v;
                }
            }
            Field::Diatonic => {
                if let (true, Ok(v)) = (self.in_transpose, text.parse::<i32>()) {
                    self.pending_transpose.diatonic = v;
                }
            }
            Field::Title => {
                if self.title.is_none() && !text.is_empty() {
                    self.title = Some(text.to_string());
                }
            }
            Field::Composer => {
                if self.composer.is_none() && !text.is_empty() {
                    self.composer = Some(text.to_string());
                }
            }
            Field::Type => {
                if let Some(note) = self.note.as_mut() {
                    note.note_type = Some(text.to_string());
                }
            }
            Field::Staff => {
                if let (Some(note), Ok(v)) = (self.note.as_mut(), text.parse::<u8>()) {
                    note.staff = Some(v);
                }
            }
            Field::Voice => {
                if let (Some(note), Ok(v)) = (self.note.as_mut(), text.parse::<u8>()) {
                    note.voice = Some(v);
                }
            }
            Field::Stem => {
                if let Some(note) = self.note.as_mut() {
                    note.stem = Some(text.to_string());
                }
            }
            Field::Accidental => {
                if let Some(note) = self.note.as_mut() {
                    note.accidental = Some(text.to_string());
                }
            }
        }
    }

    fn close(&mut self, tag: &[u8]) -> Result<(), ParseError> {
        self.field = None;

        if tag == b"part" {
            self.skipping_part = false;
            return Ok(());
        }
        if self.skipping_part {
            return Ok(());
        }

        match tag {
            b"note" => self.finish_note()?,
            b"backup" | b"forward" => self.apply_motion(),
            b"transpose" => {
                self.in_transpose = false;
                self.transpose = Some(self.pending_transpose);
            }
            b"measure" => self.finish_measure(),
            _ => {}
        }
        Ok(())
    }

    fn set_tempo(&mut self, tempo: f64) {
        // The first marking is the piece's default tempo.
        if self.tempo.is_none() && tempo.is_finite() && tempo > 0.0 {
            self.tempo = Some(tempo);
        }
    }

    fn divs_to_beats(&self, divs: f64) -> f64 {
        divs / self.divisions
    }

    fn start_measure(&mut self, number: Option<u32>) {
        self.finish_measure();
        let number = number.unwrap_or_else(|| self.measures.last().map_or(1, |m| m.number + 1));
        self.measure_extent = self.clock;
        self.last_onset = self.clock;
        self.measure = Some(OpenMeasure {
            number,
            start_beat: self.clock,
            system_index: self.current_system,
            notes: Vec::new(),
        });
    }

    fn system_break(&mut self) {
        // A break on the very first measure doesn't start a second system.
        if self.measures.is_empty() {
            return;
        }
        if let Some(open) = self.measure.as_mut() {
            if open.system_index == self.current_system {
                self.current_system += 1;
                open.system_index = self.current_system;
                self.explicit_breaks = true;
            }
        }
    }

    fn apply_motion(&mut self) {
        let Some((motion, divs)) = self.motion.take() else {
            return;
        };
        let beats = self.divs_to_beats(divs);
        let floor = self.measure.as_ref().map_or(0.0, |m| m.start_beat);
        match motion {
            Motion::Backup => self.clock = (self.clock - beats).max(floor),
            Motion::Forward => {
                self.clock += beats;
                self.measure_extent = self.measure_extent.max(self.clock);
            }
        }
    }

    fn finish_note(&mut self) -> Result<(), ParseError> {
        let Some(pending) = self.note.take() else {
            return Ok(());
        };
        if pending.is_grace {
            return Ok(());
        }

        let duration_beats = match pending.duration_divs {
            Some(divs) if self.duration_includes_dots => self.divs_to_beats(divs),
            Some(divs) => dotted(self.divs_to_beats(divs), pending.dots),
            None => pending
                .note_type
                .as_deref()
                .and_then(type_beats)
                .map(|b| dotted(b, pending.dots))
                .unwrap_or(0.0),
        };

        let beat_offset = if pending.is_chord {
            self.last_onset
        } else {
            self.clock
        };

        if !pending.is_rest {
            let measure_number = self.measure.as_ref().map_or(0, |m| m.number);
            let step = pending.step.ok_or(ParseError::MissingPitch {
                measure: measure_number,
                field: "step",
            })?;
            let octave = pending.octave.ok_or(ParseError::MissingPitch {
                measure: measure_number,
                field: "octave",
            })?;
            let note = Note {
                id: String::new(),
                pitch: pitch_name(step, pending.alter, octave),
                midi: midi_from_pitch(step, pending.alter, octave),
                duration_beats,
                beat_offset,
                measure_number,
                system_index: self.current_system,
                staff: pending.staff.unwrap_or(1),
                voice: pending.voice.unwrap_or(1),
                is_chord: pending.is_chord,
                stem: pending.stem,
                accidental: pending.accidental,
                tie: pending.tie,
                slur: pending.slur,
            };
            if let Some(open) = self.measure.as_mut() {
                open.notes.push(note);
            }
        }

        if !pending.is_chord {
            self.last_onset = beat_offset;
            self.clock += duration_beats;
            self.measure_extent = self.measure_extent.max(self.clock);
        }
        Ok(())
    }

    fn finish_measure(&mut self) {
        let Some(open) = self.measure.take() else {
            return;
        };

        let mut duration_beats = self.measure_extent - open.start_beat;
        if duration_beats <= 1e-9 {
            duration_beats = self.time.measure_beats();
        }
        self.clock = open.start_beat + duration_beats;
        self.measure_extent = self.clock;

        let mut notes = open.notes;
        notes.sort_by(|a, b| {
            a.beat_offset
                .partial_cmp(&b.beat_offset)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for (i, note) in notes.iter_mut().enumerate() {
            note.id = format!("m{}-{}", open.number, i);
            note.system_index = open.system_index;
        }

        self.measures.push(Measure {
            number: open.number,
            system_index: open.system_index,
            start_beat: open.start_beat,
            duration_beats,
            time_signature: self.time,
            notes,
        });
    }

    fn finish(mut self, options: &ParseOptions) -> Result<Score, ParseError> {
        self.finish_measure();
        if self.measures.is_empty() {
            return Err(ParseError::NoMeasures);
        }

        if !self.explicit_breaks {
            if let Some(per_system) = options.measures_per_system.filter(|n| *n > 0) {
                for (i, measure) in self.measures.iter_mut().enumerate() {
                    measure.system_index = i / per_system;
                    for note in &mut measure.notes {
                        note.system_index = measure.system_index;
                    }
                }
            }
        }

        let systems = group_systems(&self.measures);
        let notes: Vec<Note> = self
            .measures
            .iter()
            .flat_map(|m| m.notes.iter().cloned())
            .collect();
        let total_beats = self.measures.last().map_or(0.0, Measure::end_beat);
        let time_signature = self.measures[0].time_signature;
        let tempo = self.tempo.unwrap_or(DEFAULT_TEMPO);

        debug!(
            measures = self.measures.len(),
            notes = notes.len(),
            systems = systems.len(),
            tempo,
            "parsed MusicXML score"
        );

        Ok(Score {
            title: self.title,
            composer: self.composer,
            time_signature,
            key: self.key,
            tempo,
            divisions: self.divisions,
            measures: self.measures,
            systems,
            notes,
            total_beats,
            transpose: self.transpose,
        })
    }
}

/// Partitions consecutive measures into systems by their system index.
pub fn group_systems(measures: &[Measure]) -> Vec<System> {
    let mut systems: Vec<System> = Vec::new();
    for measure in measures {
        match systems.last_mut() {
            Some(system) if system.index == measure.system_index => {
                system.measure_numbers.push(measure.number);
                system.end_beat = measure.end_beat();
            }
            _ => systems.push(System {
                index: measure.system_index,
                measure_numbers: vec![measure.number],
                start_beat: measure.start_beat,
                end_beat: measure.end_beat(),
            }),
        }
    }
    systems
}
