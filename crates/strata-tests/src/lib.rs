//! Integration test harness crate for strata. All tests live in `tests/`.
