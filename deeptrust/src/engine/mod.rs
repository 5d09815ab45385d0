pub mod dispatch;
pub mod fusion;
pub mod synth;
