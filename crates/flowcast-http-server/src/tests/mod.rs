//! End-to-end transport tests against a real listener
