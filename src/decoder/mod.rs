//! External decoder plumbing
//!
//! Runs the decoder as a child process and rebuilds fixed-size frames from
//! its raw output on a dedicated thread.

mod process;
mod reassembler;

pub use process::{ChannelReader, ChannelWriter, DecoderCommand, ProcessChannel};
pub use reassembler::{
    run_reassembly, BacklogPolicy, FrameReassembler, ReassemblerConfig, ReassemblerHandle,
    ReassemblyReport, StopReason,
};
