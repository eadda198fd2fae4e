mod trace;
mod wait;

pub use trace::trace_init;
pub use wait::wait_for;
