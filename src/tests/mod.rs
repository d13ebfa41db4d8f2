//! Binary-level test suite: full wake-cycle scenarios against mocks.

mod cycle_tests;
