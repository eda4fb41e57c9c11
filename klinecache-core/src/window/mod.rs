//! Window arithmetic and the in-memory window store.

pub mod math;
pub mod store;

pub use math::{compute_fetch_window, floor_bar_start, step_ms, window_start, FetchRange};
pub use store::{
    updated_at, MergeOutcome, SyncError, SyncReport, Window, WindowState, WindowStore,
};
