//! Property tests for allocator disjointness, alignment and document
//! round-trips under arbitrary allocate/free sequences.

use crate::cluster::CELLS_PER_CLUSTER;
use crate::vat::VisualAllocationTable;
use proptest::prelude::*;

/// One step of an allocator workload.
#[derive(Debug, Clone)]
enum Op {
    Allocate { name: u8, size: u64 },
    Free { name: u8 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (any::<u8>(), 1u64..20_000).prop_map(|(name, size)| Op::Allocate { name, size }),
        any::<u8>().prop_map(|name| Op::Free { name }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// After any workload: chains are disjoint and aligned, and the owned
    /// and free sets partition the valid cluster starts.
    #[test]
    fn prop_allocator_invariants(ops in proptest::collection::vec(op_strategy(), 1..60)) {
        let mut vat = VisualAllocationTable::new(256).unwrap();
        for op in ops {
            match op {
                Op::Allocate { name, size } => {
                    let path = format!("f/{name}");
                    // Exhaustion is a legal outcome, not a property break.
                    let _ = vat.allocate(&path, size, None);
                }
                Op::Free { name } => {
                    let path = format!("f/{name}");
                    let _ = vat.free_path(&path);
                }
            }
            vat.check_invariants().unwrap();
        }

        // Every chain coordinate is an aligned cluster start.
        for (_, chain) in vat.iter_entries() {
            for &loc in chain {
                let t = vat.linear_of(loc).unwrap();
                prop_assert_eq!(t % CELLS_PER_CLUSTER, 0);
            }
        }
    }

    /// Serialization round-trips the full table state.
    #[test]
    fn prop_document_round_trip(ops in proptest::collection::vec(op_strategy(), 1..40)) {
        let mut vat = VisualAllocationTable::new(256).unwrap();
        for op in ops {
            match op {
                Op::Allocate { name, size } => {
                    let _ = vat.allocate(&format!("f/{name}"), size, None);
                }
                Op::Free { name } => {
                    let _ = vat.free_path(&format!("f/{name}"));
                }
            }
        }
        let doc = vat.to_document();
        let json = serde_json::to_string(&doc).unwrap();
        let parsed: crate::vat::VatDocument = serde_json::from_str(&json).unwrap();
        let restored = VisualAllocationTable::from_document(&parsed).unwrap();
        prop_assert_eq!(restored.digest(), vat.digest());
        prop_assert_eq!(restored.entry_count(), vat.entry_count());
        prop_assert_eq!(restored.free_count(), vat.free_count());
        restored.check_invariants().unwrap();
    }

    /// The document's declared format never changes.
    #[test]
    fn prop_document_format_tag(size in 1u64..5000) {
        let mut vat = VisualAllocationTable::new(64).unwrap();
        let _ = vat.allocate("x", size, None);
        let doc = vat.to_document();
        prop_assert_eq!(doc.format.as_str(), "visual-allocation-table-v2");
        prop_assert_eq!(doc.version.as_str(), "2.0");
    }
}
