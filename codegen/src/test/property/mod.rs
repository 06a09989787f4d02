//! Property-based tests for loop normalization.
