//! Shared proptest configuration.
//!
//! Property tests run far fewer cases under Miri so that interpretation
//! finishes in reasonable time.

/// Number of cases for property-based tests: 5 under Miri, 256 otherwise.
///
/// ```ignore
/// proptest! {
///     #![proptest_config(ProptestConfig {
///         cases: miri_case_count(),
///         ..ProptestConfig::default()
///     })]
///     #[test]
///     fn roundtrip(value in any::<u32>()) { /* ... */ }
/// }
/// ```
#[must_use]
pub const fn miri_case_count() -> u32 {
    if cfg!(miri) {
        5
    } else {
        256
    }
}
