pub mod watch;

pub use test::run_test_command;
pub use watch::run_watch_command;
