pub mod breakpoint;
pub mod eval;
pub mod events;
pub mod gate;
pub mod modules;
pub mod observer;
pub mod session;
pub mod step;
pub mod threads;
pub mod trace_record;

pub use gate::RunGate;
