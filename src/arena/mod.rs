// Arena-based storage for the reactive graph
//
// One arena holds every node regardless of kind; dispatch happens on the
// kind tag. NodeId is a lightweight index newtype, so handles stay small and
// the graph never forms ownership cycles through Rust references.

pub mod nodes;

pub use nodes::{
    current_observer, detach_deps, link, node_arena_insert, node_arena_remove,
    set_current_observer, sever, track, unlink, untrack, NodeId, NodeKind, NodeMetadata,
    ObserverGuard,
};
