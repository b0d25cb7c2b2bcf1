//! Named constants for wire method strings used across the broker protocol.
//!
//! Shared between the broker and client implementations so that method names
//! stay in sync without duplicating string literals.

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// First message a client sends; promotes its pending connection to a session.
pub const METHOD_IDENTIFY: &str = "identify";

/// Acknowledgment notification sent by the broker after `identify`,
/// carrying the assigned session id and the broker capability list.
pub const METHOD_CONNECTED: &str = "connected";

/// Liveness probe notification sent by the broker's sweep.
pub const METHOD_PING: &str = "ping";

// ---------------------------------------------------------------------------
// Popups
// ---------------------------------------------------------------------------

/// The ask dispatched to a responder; its correlation id is the popup id.
pub const METHOD_POPUP_REQUEST: &str = "popup.request";

/// Open a popup: params `{responderId?, options}`, result `{popupId}`.
pub const METHOD_POPUP_CREATE: &str = "popup.create";

/// Resolve a pending popup: params `{popupId, result}`.
pub const METHOD_POPUP_RESOLVE: &str = "popup.resolve";

/// Cancel a pending popup: params `{popupId}`.
pub const METHOD_POPUP_CANCEL: &str = "popup.cancel";

/// Cancel every pending popup, optionally filtered by responder:
/// params `{responderId?}`, result `{cancelled: [ids]}`.
pub const METHOD_POPUP_CLOSE_ALL: &str = "popup.close_all";

/// Block on one popup's terminal result: params `{popupId, timeoutMs?}`.
pub const METHOD_POPUP_WAIT: &str = "popup.wait";

/// Block on the next genuine resolution of any popup: params `{timeoutMs?}`.
pub const METHOD_POPUP_WAIT_ANY: &str = "popup.wait_any";

// ---------------------------------------------------------------------------
// Introspection
// ---------------------------------------------------------------------------

/// Health snapshot: result `{status, recentErrors}`.
pub const METHOD_STATUS: &str = "status";
