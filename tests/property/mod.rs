//! Property-based testing for mediaspan
//!
//! Uses proptest to check allocation invariants over randomly generated
//! file sizes and unit shapes.

use ::mediaspan::utils::round_to_next_multiple;
use ::mediaspan::*;
use proptest::prelude::*;
use std::collections::BTreeMap;

fn template_strategy() -> impl Strategy<Value = UnitTemplate> {
    (
        prop_oneof![Just(MediaKind::Disc), Just(MediaKind::Csd), Just(MediaKind::Tape)],
        10_000u64..1_000_000,
        prop_oneof![Just(1u64), Just(512u64), Just(2048u64), Just(4096u64)],
        0u64..5_000,
    )
        .prop_map(|(kind, total_space, block_size, reserved)| UnitTemplate {
            kind,
            total_space,
            block_size,
            reserved_capacity_bytes: reserved,
            blocking_factor: 20,
        })
}

/// Staged records with distinct paths and sizes that fit on an empty unit
fn staged(sizes: &[u64]) -> Vec<SourceFileRecord> {
    sizes
        .iter()
        .enumerate()
        .map(|(i, size)| {
            let mut record = SourceFileRecord::from_clean_path(&format!("/src/dir{}/file_{:05}.dat", i % 7, i));
            record.size = Some(*size);
            record
        })
        .collect()
}

fn allocate(template: UnitTemplate, units: Vec<DestinationUnit>, sizes: &[u64]) -> (ScanSession, AllocationReport) {
    let mut session = ScanSession::new(units);
    for record in staged(sizes) {
        session.register_new_file(record);
    }
    let report = Allocator::new(template).allocate(&mut session).unwrap();
    (session, report)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_rounding(value in 0u64..u32::MAX as u64, multiple in 1u64..100_000) {
        let rounded = round_to_next_multiple(value, multiple);
        prop_assert_eq!(rounded % multiple, 0);
        prop_assert!(rounded >= value);
        prop_assert!(rounded - value < multiple);
        prop_assert_eq!(round_to_next_multiple(rounded, multiple), rounded);
    }

    #[test]
    fn prop_capacity_invariant_holds(
        template in template_strategy(),
        fractions in prop::collection::vec(0.0f64..1.0, 1..80),
    ) {
        let max = template.max_file_size();
        prop_assume!(max > 0);
        let sizes: Vec<u64> = fractions.iter().map(|f| (f * max as f64) as u64).collect();

        let (session, _) = allocate(template, Vec::new(), &sizes);

        for unit in session.units() {
            let limit = unit.total_space - unit.reserved_capacity_bytes;
            if unit.kind.is_block_aligned() {
                prop_assert!(unit.data_size_on_disk() + unit.pending_bytes_on_disk() <= limit);
            } else {
                prop_assert!(unit.data_size() + unit.pending_bytes() < limit);
            }
        }
    }

    #[test]
    fn prop_every_file_allocated_exactly_once(
        template in template_strategy(),
        fractions in prop::collection::vec(0.0f64..1.0, 1..80),
    ) {
        let max = template.max_file_size();
        prop_assume!(max > 0);
        let sizes: Vec<u64> = fractions.iter().map(|f| (f * max as f64) as u64).collect();

        let (session, report) = allocate(template, Vec::new(), &sizes);
        prop_assert_eq!(report.assigned_files as usize, sizes.len());
        prop_assert!(session.new_files().is_empty());

        let mut owners: BTreeMap<String, Vec<u32>> = BTreeMap::new();
        for unit in session.units() {
            for file in unit.pending_files() {
                owners.entry(file.relative_path.clone()).or_default().push(unit.unit_number);
            }
        }
        prop_assert_eq!(owners.len(), sizes.len());
        prop_assert!(owners.values().all(|units| units.len() == 1));

        let assigned: u64 = session.units().iter().map(|u| u.pending_bytes()).sum();
        prop_assert_eq!(assigned, sizes.iter().sum::<u64>());
    }

    #[test]
    fn prop_allocation_is_deterministic(
        template in template_strategy(),
        fractions in prop::collection::vec(0.0f64..1.0, 1..40),
    ) {
        let max = template.max_file_size();
        prop_assume!(max > 0);
        let sizes: Vec<u64> = fractions.iter().map(|f| (f * max as f64) as u64).collect();

        let placement = |session: &ScanSession| -> Vec<(String, u32)> {
            let mut placed: Vec<(String, u32)> = session
                .units()
                .iter()
                .flat_map(|u| u.pending_files().map(move |f| (f.relative_path.clone(), u.unit_number)))
                .collect();
            placed.sort();
            placed
        };

        let (first, _) = allocate(template, Vec::new(), &sizes);
        let (second, _) = allocate(template, Vec::new(), &sizes);
        prop_assert_eq!(placement(&first), placement(&second));
    }

    #[test]
    fn prop_first_fit_prefers_lowest_unit(
        template in template_strategy(),
        fractions in prop::collection::vec(0.0f64..1.0, 1..40),
    ) {
        let max = template.max_file_size();
        prop_assume!(max > 0);
        let sizes: Vec<u64> = fractions.iter().map(|f| (f * max as f64) as u64).collect();

        let (session, _) = allocate(template, Vec::new(), &sizes);

        // The last file placed on unit N did not fit any unit below N at the
        // time, so no lower unit may have room for it now either.
        for unit in session.units() {
            let Some(last) = unit.pending_files().last() else { continue };
            let size = last.size.unwrap_or(0);
            for lower in session.units().iter().filter(|u| u.unit_number < unit.unit_number) {
                prop_assert!(!lower.can_accept(size));
            }
        }
    }
}
