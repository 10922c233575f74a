//! Resource and mode bitmasks shared by every protocol layer.

use bitflags::bitflags;

bitflags! {
    /// Device resources a set can request from the manager.
    ///
    /// Bit positions are part of the wire protocol and must not be
    /// renumbered. Bit 7 is intentionally unassigned; the physical-button
    /// block starts at bit 8.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ResourceFlags: u32 {
        /// Audio playback path.
        const AUDIO_PLAYBACK = 1 << 0;

        /// Video playback path.
        const VIDEO_PLAYBACK = 1 << 1;

        /// Audio recording path.
        const AUDIO_RECORDING = 1 << 2;

        /// Video recording path.
        const VIDEO_RECORDING = 1 << 3;

        /// Vibration motor.
        const VIBRA = 1 << 4;

        /// Indicator LEDs.
        const LEDS = 1 << 5;

        /// Display backlight.
        const BACKLIGHT = 1 << 6;

        /// System (power/home) button.
        const SYSTEM_BUTTON = 1 << 8;

        /// Keypad lock button.
        const LOCK_BUTTON = 1 << 9;

        /// Camera zoom/scale rocker.
        const SCALE_BUTTON = 1 << 10;

        /// Camera shutter button.
        const SNAP_BUTTON = 1 << 11;

        /// Lens cover switch.
        const LENS_COVER = 1 << 12;
    }
}

bitflags! {
    /// Per-set behavioral modes carried by Register and Update.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ModeFlags: u32 {
        /// Manager may silently revoke the grant when the set loses arbitration.
        const AUTO_RELEASE = 1 << 0;

        /// Manager replies to every request even when nothing changed.
        const ALWAYS_REPLY = 1 << 1;
    }
}

impl Default for ResourceFlags {
    fn default() -> Self {
        Self::empty()
    }
}

impl Default for ModeFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Resource bitmask quadruple carried by Register/Update and cached on every
/// resource set.
///
/// Invariants: `opt ⊆ all`, `mask ⊆ all`, `share ⊆ mask`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RsetFlags {
    /// Every resource the set is interested in.
    pub all: ResourceFlags,
    /// The subset of `all` the set can live without.
    pub opt: ResourceFlags,
    /// The shareable resources this set currently asserts.
    pub share: ResourceFlags,
    /// The subset of `all` that is shareable at all.
    pub mask: ResourceFlags,
}

impl RsetFlags {
    /// Build a quadruple from its four masks without validation.
    pub fn new(
        all: ResourceFlags,
        opt: ResourceFlags,
        share: ResourceFlags,
        mask: ResourceFlags,
    ) -> Self {
        Self {
            all,
            opt,
            share,
            mask,
        }
    }

    /// Check the subset invariants.
    pub fn is_well_formed(&self) -> bool {
        self.all.contains(self.opt) && self.all.contains(self.mask) && self.mask.contains(self.share)
    }
}

/// Which side of the protocol a connection speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The central arbiter owning the well-known endpoint.
    Manager,
    /// An application negotiating resource access.
    Client,
}

/// Error codes carried in Status messages.
///
/// Positive codes come from the manager's policy layer and are opaque to the
/// engine; the engine itself only ever writes the constants below.
pub mod errcode {
    /// Request succeeded.
    pub const NONE: i32 = 0;

    /// Synthesized when a reply was malformed or mismatched, or the peer
    /// vanished while a reply was outstanding.
    pub const PEER_ERROR: i32 = -1;

    /// Synthesized by the sequencer when a send could not be attempted.
    pub const SEND_FAILED: i32 = -2;

    /// Synthesized by the no-reply watchdog.
    pub const TIMEOUT: i32 = 62;
}

const RESOURCE_NAMES: &[(ResourceFlags, &str)] = &[
    (ResourceFlags::AUDIO_PLAYBACK, "audio_playback"),
    (ResourceFlags::VIDEO_PLAYBACK, "video_playback"),
    (ResourceFlags::AUDIO_RECORDING, "audio_recording"),
    (ResourceFlags::VIDEO_RECORDING, "video_recording"),
    (ResourceFlags::VIBRA, "vibra"),
    (ResourceFlags::LEDS, "leds"),
    (ResourceFlags::BACKLIGHT, "backlight"),
    (ResourceFlags::SYSTEM_BUTTON, "system_button"),
    (ResourceFlags::LOCK_BUTTON, "lock_button"),
    (ResourceFlags::SCALE_BUTTON, "scale_button"),
    (ResourceFlags::SNAP_BUTTON, "snap_button"),
    (ResourceFlags::LENS_COVER, "lens_cover"),
];

/// Render a resource mask as a comma separated name list followed by the hex
/// value, e.g. `audio_playback,vibra (0x11)`.
pub fn res_str(res: ResourceFlags) -> String {
    let names: Vec<&str> = RESOURCE_NAMES
        .iter()
        .filter(|(flag, _)| res.contains(*flag))
        .map(|(_, name)| *name)
        .collect();

    if names.is_empty() {
        format!("<none> (0x{:x})", res.bits())
    } else {
        format!("{} (0x{:x})", names.join(","), res.bits())
    }
}
