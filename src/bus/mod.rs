// Copyright 2026 The Busgate Project
// SPDX-License-Identifier: Apache-2.0

// Realtime bus plumbing.
//
// Responsibilities:
// - Decode inbound envelopes into typed delta frames (malformed input dropped)
// - Build the subscribe frame and recognise its confirmation
// - Dial websocket connections and fan their frames out to subscribers

mod frame;
mod transport;

pub use frame::{
    encode_message, is_attach_confirmation, parse_envelope, subscribe_frame, ContentSegment,
    DeltaEvent, DeltaFrame, SegmentKind, EVENT_COMPLETE, EVENT_UPDATE,
};
pub use transport::{bus_channel, BusConnector, BusError, BusFeed, BusLink, WsBusConnector};
