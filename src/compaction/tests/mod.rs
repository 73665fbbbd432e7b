pub mod helpers;

mod tests_time_window;
