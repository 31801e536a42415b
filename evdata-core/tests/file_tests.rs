//! Decoding from files on disk: TOML hardware maps and raw event files.

use byteorder::{LittleEndian, WriteBytesExt};
use evdata_core::parser::{push_segment, EventReader};
use evdata_core::{
    DecodeEngine, DecodeError, EngineConfig, MapError, SlotCsvWriter, TomlMapResolver,
};
use std::fs::{self, File};
use std::io::BufReader;

const MAP_TEXT: &str = r#"
[[period]]
valid_from = 0

[[period.slot]]
crate = 3
slot = 5
module = "ADC"
channels = 4

[[period]]
valid_from = 1000

[[period.slot]]
crate = 3
slot = 5
module = "ADC"
channels = 4

[[period.slot]]
crate = 4
slot = 1
module = "TDC"
channels = 16
data_per_channel = 8
"#;

fn write_events(path: &std::path::Path, events: &[Vec<u32>]) {
    let mut file = File::create(path).unwrap();
    for event in events {
        file.write_u32::<LittleEndian>(event.len() as u32).unwrap();
        for &w in event {
            file.write_u32::<LittleEndian>(w).unwrap();
        }
    }
}

#[test]
fn test_decode_event_file_with_toml_map() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("hall.toml"), MAP_TEXT).unwrap();

    let mut first = Vec::new();
    push_segment(&mut first, 3, 5, &[10, 20, 30, 40]);
    push_segment(&mut first, 4, 1, &[0x0200_0005]);
    let mut second = Vec::new();
    push_segment(&mut second, 4, 1, &[0x0F00_0006]);
    let raw = dir.path().join("run.dat");
    write_events(&raw, &[first, second]);

    let config = EngineConfig::from_toml_str(
        r#"
map_name = "hall"
run_time = 1500
"#,
    )
    .unwrap();
    let mut engine = DecodeEngine::with_standard_modules(TomlMapResolver::new(dir.path())).unwrap();
    engine.apply_config(&config);
    engine.init().unwrap();
    assert_eq!(engine.active_indices().len(), 2);

    let csv_path = dir.path().join("out.csv");
    let mut writer = SlotCsvWriter::create(&csv_path).unwrap();
    writer.write_header().unwrap();

    let reader = EventReader::new(BufReader::new(File::open(&raw).unwrap()));
    for (n, event) in reader.enumerate() {
        let event = event.unwrap();
        assert!(engine.decode_event(&event).unwrap().is_complete());
        writer.write_event(n as u64, engine.decoded_records()).unwrap();
    }
    writer.flush().unwrap();
    assert_eq!(engine.stats().events, 2);
    assert_eq!(writer.rows(), 6);

    let text = fs::read_to_string(&csv_path).unwrap();
    assert!(text.contains("0,3,5,3,0,40"));
    assert!(text.contains("0,4,1,2,0,5"));
    assert!(text.contains("1,4,1,15,0,6"));
    // (3,5) was cleared before the second event
    assert!(!text.contains("1,3,5,"));
}

#[test]
fn test_early_run_uses_early_period() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("hall.toml"), MAP_TEXT).unwrap();

    let mut engine = DecodeEngine::with_standard_modules(TomlMapResolver::new(dir.path())).unwrap();
    engine.set_map_name("hall");
    engine.set_run_time(10);
    engine.init().unwrap();
    assert_eq!(engine.active_indices().len(), 1);
    assert!(engine.slot_record(4, 1).is_err());
}

#[test]
fn test_missing_map_file_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = DecodeEngine::with_standard_modules(TomlMapResolver::new(dir.path())).unwrap();
    engine.set_map_name("absent");
    let err = engine.init().unwrap_err();
    assert!(err.to_string().contains("absent"));
    assert!(engine.needs_init());
}

#[test]
fn test_oversized_map_entry_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("huge.toml"),
        r#"
[[period]]
valid_from = 0

[[period.slot]]
crate = 2
slot = 3
module = "ADC"
channels = 1
data_per_channel = 9223372036854775807
"#,
    )
    .unwrap();

    let mut engine = DecodeEngine::with_standard_modules(TomlMapResolver::new(dir.path())).unwrap();
    engine.set_map_name("huge");
    engine.set_run_time(1);
    let err = engine.init().unwrap_err();
    assert!(matches!(
        err,
        DecodeError::MapResolution {
            source: MapError::InvalidCapacity { .. },
            ..
        }
    ));
    assert!(engine.needs_init());
}

#[test]
fn test_csv_skips_slots_not_hit_in_event() {
    let map = r#"
[[period]]
[[period.slot]]
crate = 0
slot = 1
module = "ADC"
channels = 2

[[period.slot]]
crate = 0
slot = 2
module = "Scaler"
channels = 1
clear = false
"#;
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("keep.toml"), map).unwrap();
    let mut engine = DecodeEngine::with_standard_modules(TomlMapResolver::new(dir.path())).unwrap();
    engine.set_map_name("keep");
    engine.set_run_time(1);
    engine.init().unwrap();

    let mut first = Vec::new();
    push_segment(&mut first, 0, 1, &[11, 12]);
    push_segment(&mut first, 0, 2, &[77]);
    let mut second = Vec::new();
    push_segment(&mut second, 0, 1, &[21, 22]);

    let csv_path = dir.path().join("keep.csv");
    let mut writer = SlotCsvWriter::create(&csv_path).unwrap();
    for (n, event) in [first, second].iter().enumerate() {
        engine.decode_event(event).unwrap();
        writer.write_event(n as u64, engine.decoded_records()).unwrap();
    }
    writer.flush().unwrap();

    let text = fs::read_to_string(&csv_path).unwrap();
    assert!(text.contains("0,0,2,0,0,77"));
    // The scaler keeps its value but was not read out in event 1
    assert!(!text.lines().any(|l| l.starts_with("1,0,2,")));
    assert!(text.contains("1,0,1,1,0,22"));
    assert_eq!(writer.rows(), 5);
    assert_eq!(engine.slot_record(0, 2).unwrap().channel(0), &[77]);
}
