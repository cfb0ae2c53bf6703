pub mod buffers;
pub mod run;
pub mod synth;

mod util;
