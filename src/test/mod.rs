//! Scenario tests for the tree and the image database
//!
//! These run whole operation sequences against real files and check the
//! structural invariants after every step.
