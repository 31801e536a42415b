//! End-to-end tests for the decode engine: init protocol, per-event
//! dispatch, map changes and multi-instance use.

use evdata_core::parser::{make_header, push_segment};
use evdata_core::{
    ChannelCapacity, CrateMap, DecodeEngine, DecodeError, EventStatus, GridError, HardwareMap,
    MapEntry, MapError, MapResolver, ModuleTypeId, SlotAddress, StaticMapResolver, MAX_CRATES,
    MAX_SLOTS,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

const MAP: &str = "testmap";

/// Resolver that counts how often it is asked.
struct CountingResolver {
    inner: StaticMapResolver,
    calls: Arc<AtomicUsize>,
}

impl MapResolver for CountingResolver {
    fn resolve(&self, name: &str, run_time: u64) -> Result<Box<dyn HardwareMap>, MapError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.resolve(name, run_time)
    }
}

/// Map that reports one used slot with an arbitrary capacity, bypassing
/// the checks of `CrateMap::insert`.
struct RawMap {
    addr: SlotAddress,
    module: ModuleTypeId,
    capacity: ChannelCapacity,
}

impl HardwareMap for RawMap {
    fn name(&self) -> &str {
        MAP
    }

    fn is_used(&self, addr: SlotAddress) -> bool {
        addr == self.addr
    }

    fn module_type(&self, addr: SlotAddress) -> Option<&ModuleTypeId> {
        self.is_used(addr).then_some(&self.module)
    }

    fn channel_capacity(&self, addr: SlotAddress) -> ChannelCapacity {
        if self.is_used(addr) {
            self.capacity
        } else {
            ChannelCapacity::default()
        }
    }

    fn clear_on_event(&self, addr: SlotAddress) -> bool {
        self.is_used(addr)
    }

    fn set_unused(&mut self, _addr: SlotAddress) {}
}

struct RawMapResolver(ChannelCapacity);

impl MapResolver for RawMapResolver {
    fn resolve(&self, _name: &str, _run_time: u64) -> Result<Box<dyn HardwareMap>, MapError> {
        Ok(Box::new(RawMap {
            addr: SlotAddress::new(3, 5).unwrap(),
            module: ModuleTypeId::new("ADC"),
            capacity: self.0,
        }))
    }
}

fn adc_map() -> CrateMap {
    CrateMap::new(MAP)
        .with_slot(3, 5, MapEntry::new("ADC", 4, 1))
        .unwrap()
}

fn scenario_map() -> CrateMap {
    adc_map()
        .with_slot(1, 2, MapEntry::new("TDC", 8, 4).clear_on_event(false))
        .unwrap()
        .with_slot(0, 7, MapEntry::new("Scaler", 2, 1))
        .unwrap()
}

fn engine_with(resolver: impl MapResolver + 'static) -> DecodeEngine {
    let mut engine = DecodeEngine::with_standard_modules(resolver).unwrap();
    engine.set_map_name(MAP);
    engine.set_run_time(100);
    engine
}

fn ready_engine(map: CrateMap) -> DecodeEngine {
    let mut engine = engine_with(StaticMapResolver::new().with_map(0, map));
    engine.init().unwrap();
    engine
}

#[test]
fn test_adc_event_then_clear() {
    let mut engine = ready_engine(adc_map());

    let mut event = Vec::new();
    push_segment(&mut event, 3, 5, &[10, 20, 30, 40]);
    let summary = engine.decode_event(&event).unwrap();
    assert_eq!(summary.status, EventStatus::Complete);
    assert_eq!(summary.segments_decoded, 1);
    assert_eq!(
        engine.slot_record(3, 5).unwrap().data().values(),
        vec![10, 20, 30, 40]
    );

    // No segment for (3,5): the clear must leave nothing behind
    engine.decode_event(&[]).unwrap();
    assert!(engine.slot_record(3, 5).unwrap().data().is_empty());
}

#[test]
fn test_unmapped_segment_is_skipped() {
    let mut engine = ready_engine(adc_map());

    let mut event = Vec::new();
    push_segment(&mut event, 3, 9, &[1, 2, 3]);
    let summary = engine.decode_event(&event).unwrap();
    assert_eq!(summary.status, EventStatus::Complete);
    assert_eq!(summary.segments_skipped, 1);
    assert_eq!(
        engine.slot_record(3, 9).unwrap_err(),
        GridError::NotFound(SlotAddress::new(3, 9).unwrap())
    );
    assert_eq!(engine.allocated_slots(), 1);
}

#[test]
fn test_unknown_module_is_demoted() {
    let map = adc_map()
        .with_slot(1, 2, MapEntry::new("NoSuchModule", 4, 1))
        .unwrap();
    let mut engine = ready_engine(map);

    assert_eq!(engine.stats().config_warnings, 1);
    let addr = SlotAddress::new(1, 2).unwrap();
    assert!(!engine.hardware_map().unwrap().is_used(addr));
    assert_eq!(engine.active_indices().len(), 1);

    // Data for the demoted slot is ignored from now on
    let mut event = Vec::new();
    push_segment(&mut event, 1, 2, &[5]);
    let summary = engine.decode_event(&event).unwrap();
    assert_eq!(summary.segments_skipped, 1);
    assert!(engine.slot_record(1, 2).is_err());
}

#[test]
fn test_out_of_range_addresses() {
    let mut engine = ready_engine(adc_map());

    assert_eq!(
        engine.slot_record(MAX_CRATES, 0).unwrap_err(),
        GridError::OutOfRange {
            crate_num: MAX_CRATES,
            slot: 0
        }
    );
    assert!(matches!(
        engine.slot_record(0, MAX_SLOTS),
        Err(GridError::OutOfRange { .. })
    ));

    let mut event = Vec::new();
    push_segment(&mut event, 200, 250, &[1, 2]);
    push_segment(&mut event, 3, 5, &[4]);
    let summary = engine.decode_event(&event).unwrap();
    assert_eq!(summary.status, EventStatus::Partial);
    assert_eq!(summary.segments_discarded, 1);
    assert_eq!(summary.segments_decoded, 1);
    assert_eq!(engine.slot_record(3, 5).unwrap().channel(0), &[4]);
}

#[test]
fn test_garbage_buffer_does_not_panic() {
    let mut engine = ready_engine(scenario_map());
    let garbage: Vec<u32> = (0..500u32)
        .map(|i| i.wrapping_mul(2_654_435_761))
        .collect();
    let summary = engine.decode_event(&garbage).unwrap();
    assert_eq!(engine.stats().events, 1);
    assert!(summary.segments_decoded + summary.segments_skipped + summary.segments_discarded > 0);
}

#[test]
fn test_active_indices_match_map() {
    let map = scenario_map();
    let used = map.used_slots();
    let engine = ready_engine(map);

    assert_eq!(engine.active_indices().len(), used.len());
    for &idx in engine.active_indices() {
        let addr = SlotAddress::from_index(idx).unwrap();
        let record = engine.slot_record(addr.crate_num(), addr.slot()).unwrap();
        assert_eq!(record.address(), addr);
    }
    assert_eq!(engine.clear_indices().len(), 2);
    assert!(engine
        .clear_indices()
        .iter()
        .all(|i| engine.active_indices().contains(i)));
}

#[test]
fn test_decode_before_init_is_fatal() {
    let mut engine = engine_with(StaticMapResolver::new().with_map(0, scenario_map()));
    let mut event = Vec::new();
    push_segment(&mut event, 3, 5, &[1]);
    assert!(matches!(
        engine.decode_event(&event),
        Err(DecodeError::NotInitialized)
    ));
    assert_eq!(engine.allocated_slots(), 0);
    assert_eq!(engine.stats().events, 0);

    // After a timestamp change the engine again refuses to decode and
    // leaves existing data alone.
    engine.init().unwrap();
    let mut event = Vec::new();
    push_segment(&mut event, 1, 2, &[0x0000_0011]);
    engine.decode_event(&event).unwrap();

    engine.set_run_time(200);
    assert!(matches!(
        engine.decode_event(&[]),
        Err(DecodeError::NotInitialized)
    ));
    assert_eq!(engine.slot_record(1, 2).unwrap().channel(0), &[0x11]);
}

#[test]
fn test_reinit_same_key_is_noop() {
    let calls = Arc::new(AtomicUsize::new(0));
    let resolver = CountingResolver {
        inner: StaticMapResolver::new().with_map(0, scenario_map()),
        calls: Arc::clone(&calls),
    };
    let mut engine = engine_with(resolver);
    engine.init().unwrap();

    let mut event = Vec::new();
    push_segment(&mut event, 1, 2, &[0x0100_0001]);
    engine.decode_event(&event).unwrap();

    let active = engine.active_indices().to_vec();
    let clear = engine.clear_indices().to_vec();

    engine.set_map_name(MAP);
    engine.set_run_time(100);
    engine.init().unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(engine.active_indices(), &active[..]);
    assert_eq!(engine.clear_indices(), &clear[..]);
    // Non-clearable slot still holds its data: the record was not rebuilt
    assert_eq!(engine.slot_record(1, 2).unwrap().channel(1), &[1]);
}

#[test]
fn test_timestamp_change_keeps_unchanged_records() {
    let mut engine = ready_engine(scenario_map());
    let mut event = Vec::new();
    push_segment(&mut event, 1, 2, &[0x0000_0003]);
    engine.decode_event(&event).unwrap();

    engine.set_run_time(5000);
    assert!(engine.needs_init());
    engine.init().unwrap();
    assert!(engine.is_first_event());
    assert_eq!(engine.slot_record(1, 2).unwrap().channel(0), &[3]);
}

#[test]
fn test_map_shrink_leaves_stale_record_until_reclaimed() {
    let resolver = StaticMapResolver::new()
        .with_map(0, scenario_map())
        .with_map(1000, adc_map());
    let mut engine = engine_with(resolver);
    engine.init().unwrap();
    assert_eq!(engine.allocated_slots(), 3);

    engine.set_run_time(2000);
    engine.init().unwrap();
    assert_eq!(engine.active_indices().len(), 1);
    assert_eq!(engine.clear_indices().len(), 1);
    assert_eq!(engine.allocated_slots(), 3);
    assert!(engine.slot_record(1, 2).is_err());

    assert_eq!(engine.reclaim_unused_slots(), 2);
    assert_eq!(engine.allocated_slots(), 1);
}

#[test]
fn test_map_growth_adds_records() {
    let resolver = StaticMapResolver::new()
        .with_map(0, adc_map())
        .with_map(1000, scenario_map());
    let mut engine = engine_with(resolver);
    engine.init().unwrap();
    assert_eq!(engine.active_indices().len(), 1);

    engine.set_run_time(1500);
    engine.init().unwrap();
    assert_eq!(engine.active_indices().len(), 3);
    assert_eq!(engine.dev_type(0, 7).unwrap().as_str(), "Scaler");
}

#[test]
fn test_map_name_change_rebuilds_grid() {
    let other = CrateMap::new("other")
        .with_slot(2, 2, MapEntry::new("ADC", 1, 1))
        .unwrap();
    let resolver = StaticMapResolver::new()
        .with_map(0, scenario_map())
        .with_map(0, other);
    let mut engine = engine_with(resolver);
    engine.init().unwrap();
    assert_eq!(engine.allocated_slots(), 3);

    engine.set_map_name("other");
    engine.init().unwrap();
    assert_eq!(engine.allocated_slots(), 1);
    assert!(engine.slot_record(2, 2).is_ok());
}

#[test]
fn test_segments_processed_in_buffer_order() {
    let map = CrateMap::new(MAP)
        .with_slot(1, 1, MapEntry::new("TDC", 2, 8))
        .unwrap();
    let mut engine = ready_engine(map);

    let mut event = Vec::new();
    push_segment(&mut event, 1, 1, &[0x0000_0001]);
    push_segment(&mut event, 1, 1, &[0x0000_0002, 0x0000_0003]);
    push_segment(&mut event, 1, 1, &[0x0000_0004]);
    let summary = engine.decode_event(&event).unwrap();
    assert_eq!(summary.segments_decoded, 3);

    let record = engine.slot_record(1, 1).unwrap();
    assert_eq!(record.channel(0), &[1, 2, 3, 4]);
    assert_eq!(record.num_segments(), 3);
}

#[test]
fn test_truncated_trailing_segment() {
    let mut engine = ready_engine(adc_map());
    let mut event = Vec::new();
    push_segment(&mut event, 3, 5, &[9]);
    event.push(make_header(3, 5, 100));
    event.push(1);

    let summary = engine.decode_event(&event).unwrap();
    assert_eq!(summary.status, EventStatus::Partial);
    assert_eq!(engine.slot_record(3, 5).unwrap().channel(0), &[9]);
    assert_eq!(engine.stats().segments_discarded, 1);
}

#[test]
fn test_concurrent_engines_have_distinct_instances() {
    const THREADS: usize = 8;
    let barrier = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut engine = ready_engine(adc_map());
                let mut event = Vec::new();
                push_segment(&mut event, 3, 5, &[t as u32]);
                engine.decode_event(&event).unwrap();
                assert_eq!(engine.slot_record(3, 5).unwrap().channel(0), &[t as u32]);

                // Hold the engine until every thread has one
                let id = engine.instance();
                barrier.wait();
                id
            })
        })
        .collect();

    let ids: HashSet<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    assert_eq!(ids.len(), THREADS);
}

#[test]
fn test_dropped_engine_releases_instance() {
    let registry = evdata_core::InstanceRegistry::global();
    let first = ready_engine(adc_map());
    let second = ready_engine(adc_map());
    assert_ne!(first.instance(), second.instance());
    assert!(registry.is_live(first.instance()));
    assert!(registry.is_live(second.instance()));

    drop(second);
    assert!(registry.is_live(first.instance()));
}

#[test]
fn test_default_map_name() {
    let map = CrateMap::new("process-default")
        .with_slot(0, 1, MapEntry::new("ADC", 1, 1))
        .unwrap();
    evdata_core::set_default_map_name("process-default").unwrap();

    let mut engine =
        DecodeEngine::with_standard_modules(StaticMapResolver::new().with_map(0, map)).unwrap();
    engine.set_run_time(1);
    assert_eq!(engine.map_name(), "process-default");
    engine.set_map_name("");
    engine.init().unwrap();
    assert!(engine.slot_record(0, 1).is_ok());
}

#[test]
fn test_oversized_capacity_is_fatal_at_init() {
    for capacity in [
        ChannelCapacity::new(1, 9_223_372_036_854_775_807),
        ChannelCapacity::new(usize::MAX, 1),
    ] {
        let mut engine = engine_with(RawMapResolver(capacity));
        match engine.init() {
            Err(DecodeError::MapResolution {
                source: MapError::InvalidCapacity { addr, .. },
                ..
            }) => assert_eq!(addr, SlotAddress::new(3, 5).unwrap()),
            other => panic!("expected invalid capacity, got {:?}", other),
        }
        assert!(engine.needs_init());
        assert!(matches!(
            engine.decode_event(&[]),
            Err(DecodeError::NotInitialized)
        ));
    }
}

#[test]
fn test_decoded_records_only_lists_current_event() {
    let mut engine = ready_engine(scenario_map());

    let mut first = Vec::new();
    push_segment(&mut first, 3, 5, &[1, 2, 3, 4]);
    push_segment(&mut first, 1, 2, &[0x0000_0009]);
    engine.decode_event(&first).unwrap();
    let hit: Vec<_> = engine.decoded_records().map(|r| r.address()).collect();
    assert_eq!(hit.len(), 2);

    let mut second = Vec::new();
    push_segment(&mut second, 3, 5, &[5, 6, 7, 8]);
    engine.decode_event(&second).unwrap();
    let hit: Vec<_> = engine
        .decoded_records()
        .map(|r| (r.crate_num(), r.slot()))
        .collect();
    assert_eq!(hit, vec![(3, 5)]);

    // (1, 2) keeps its data across events but was not hit this time
    let tdc = engine.slot_record(1, 2).unwrap();
    assert_eq!(tdc.channel(0), &[9]);
    assert_eq!(tdc.event_segments(), 0);

    engine.decode_event(&[]).unwrap();
    assert_eq!(engine.decoded_records().count(), 0);
}
