//! Test suites for the lifecycle supervisor.

mod support;
