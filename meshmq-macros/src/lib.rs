#![deny(unsafe_code)]
extern crate proc_macro;
extern crate proc_macro2;

mod metrics;

/// Generates counter accessors for a struct whose fields are all `AtomicUsize`.
///
/// For every field `foo` the struct gains `foo_inc()` and `foo()`, plus `new()`,
/// `to_json()` (keys use `.` instead of `_`) and `add()` for folding two snapshots.
#[proc_macro_derive(Metrics)]
pub fn derive_metrics(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    metrics::build(input)
}
