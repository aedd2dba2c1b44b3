//! On-wire formats: the data-path frame and the control-channel messages.

pub mod control;
pub mod frame;

pub use control::{
    ChallengeBody, ControlMessage, EstablishedBody, HelloBody, ResponseBody,
};
pub use frame::{decode_frame, FrameFlags, FrameHeader, FrameType};
