//! Workspace root crate. Holds no runtime code of its own — it exists so the
//! cross-service integration suites under `tests/integration/` can depend on
//! both `gateway` and `stats-relay` from one place instead of duplicating a
//! test harness per crate.
