//! Property-based tests for heapscope using proptest

use heapscope_core::dump_writer::DumpWriter;
use heapscope_core::{Allocation, HeapId, HeapInfo, Module, SnapshotIdentity, TracebackId};
use heapscope_parser::{parse_diff, parse_snapshot};
use proptest::prelude::*;

// Strategies for generating test data

prop_compose! {
    fn arb_allocation()(
        address in 0x1000u32..0x0100_0000,
        size in 1u32..0x1000,
        overhead in 0u32..0x20,
        traceback in 1u32..16,
    ) -> Allocation {
        Allocation { address, size, overhead, traceback: TracebackId(traceback) }
    }
}

prop_compose! {
    fn arb_heap()(
        id in 0x1000u32..0x7FFF_0000,
        allocations in prop::collection::vec(arb_allocation(), 0..40),
    ) -> (HeapId, Vec<Allocation>) {
        (HeapId(id), allocations)
    }
}

fn render(heaps: &[(HeapId, Vec<Allocation>)]) -> String {
    let module = Module::new(r"c:\app\app.exe", 0x0040_0000, 0x0010_0000);
    let mut writer = DumpWriter::new();
    writer.modules([&module]);
    for (id, allocations) in heaps {
        writer.begin_heap(*id);
        for allocation in allocations {
            let frames = [0x0040_0000 + allocation.traceback.0 * 0x10];
            writer.allocation(allocation, Some(&frames));
        }
        writer.end_heap(*id);
    }
    writer.finish()
}

fn identity() -> SnapshotIdentity {
    SnapshotIdentity::from_path("snapshot_0001_20240101-000000.heap")
}

proptest! {
    #[test]
    fn test_parsing_preserves_every_allocation(heaps in prop::collection::vec(arb_heap(), 1..4)) {
        let snapshot = parse_snapshot(identity(), &render(&heaps));

        let expected_count: usize = heaps.iter().map(|(_, a)| a.len()).sum();
        let expected_bytes: u64 = heaps
            .iter()
            .flat_map(|(_, a)| a.iter())
            .map(|a| u64::from(a.size))
            .sum();
        prop_assert_eq!(snapshot.allocation_count(), expected_count);
        prop_assert_eq!(snapshot.total_requested(), expected_bytes);

        for heap in snapshot.heaps.values() {
            prop_assert!(heap.allocations.windows(2).all(|w| w[0].address <= w[1].address));
            prop_assert_eq!(heap.info().allocation_count, heap.allocations.len());
        }
    }

    #[test]
    fn test_parsing_is_deterministic(heaps in prop::collection::vec(arb_heap(), 1..3)) {
        let text = render(&heaps);
        let first = parse_snapshot(identity(), &text);
        let second = parse_snapshot(identity(), &text);
        prop_assert_eq!(first.summary(), second.summary());
        prop_assert_eq!(first.unique_frames(), second.unique_frames());
    }

    #[test]
    fn test_heap_info_accounting(mut allocations in prop::collection::vec(arb_allocation(), 1..60)) {
        allocations.sort_by_key(|a| a.address);
        let info = HeapInfo::compute(HeapId(0x1000), &allocations);

        prop_assert_eq!(info.occupied_spans, info.empty_spans + 1);
        prop_assert_eq!(info.estimated_start, allocations[0].address);
        prop_assert!(info.largest_occupied_span <= info.estimated_size);
        prop_assert!(info.largest_free_span <= info.estimated_size);
        let span_total = u64::from(allocations[0].address) + info.estimated_size;
        let last_end = allocations.iter().map(Allocation::end).max().unwrap_or(0);
        prop_assert_eq!(span_total, last_end);
    }

    #[test]
    fn test_diff_sort_orders_by_magnitude(deltas in prop::collection::vec(-0x10000i64..0x10000, 1..30)) {
        let mut text = String::new();
        for (i, delta) in deltas.iter().enumerate() {
            let (sign, old, new) = if *delta < 0 {
                ('-', delta.unsigned_abs(), 0)
            } else {
                ('+', 0, delta.unsigned_abs())
            };
            let id = i + 1;
            text.push_str(&format!(
                "{sign} {:X} ({new:X} - {old:X}) 1 allocs\tBackTrace{id:X}\n\tapp!f{id}+0\n\n",
                delta.unsigned_abs()
            ));
        }

        let mut diff = parse_diff(&text);
        prop_assert_eq!(diff.entries.len(), deltas.len());
        prop_assert_eq!(diff.total_bytes_delta(), deltas.iter().sum::<i64>());

        diff.sort_by_magnitude();
        prop_assert!(diff
            .entries
            .windows(2)
            .all(|w| w[0].bytes_delta.unsigned_abs() >= w[1].bytes_delta.unsigned_abs()));
    }
}
