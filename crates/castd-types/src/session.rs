//! Session parameters supplied by the owner of a controller.
//!
//! A session object negotiates the stream endpoints and display placement
//! before a worker is launched; the controller only ever reads these values,
//! once at spawn time (environment) and once per `Configure` call.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Region of the display the worker captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Read-only parameters for one encoder session.
///
/// `rtcp_port` covers both the peer and local RTCP entries of the
/// `Configure` payload; a session that negotiated no RTCP leaves it `None`
/// and neither entry is sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionParams {
    /// Display target the worker captures, exported as `DISPLAY`.
    pub display_name: String,
    /// Authentication cookie file, exported as `XAUTHORITY`.
    pub display_auth: PathBuf,
    /// Network address of the stream sink.
    pub peer_address: String,
    /// Network address the worker binds locally.
    pub local_address: String,
    /// Primary RTP port on the peer.
    pub rtp_port: u16,
    /// Negotiated RTCP port, if any.
    pub rtcp_port: Option<u16>,
    /// Visible region to capture, if the session has one.
    pub display_rect: Option<DisplayRect>,
}
