//! SETTINGS parameters.
//!
//! <https://www.rfc-editor.org/rfc/rfc9113.html#name-settings>
use bytes::BufMut;

/// Settings advertised by one endpoint.
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    /// Maximum size of the peer's field-block compression table.
    pub header_table_size: u32,
    /// Whether server push is permitted. This server never pushes.
    pub enable_push: bool,
    /// Maximum concurrent streams the sender will allow.
    pub max_concurrent_streams: Option<u32>,
    /// Initial stream-level flow-control window.
    pub initial_window_size: u32,
    /// Largest frame payload the sender is willing to receive.
    pub max_frame_size: u32,
}

impl Settings {
    /// RFC defaults.
    pub(crate) fn new() -> Self {
        Self {
            header_table_size: 4096,
            enable_push: true,
            max_concurrent_streams: None,
            initial_window_size: 65535,
            max_frame_size: 16384,
        }
    }

    /// Settings this server advertises.
    pub(crate) fn server() -> Self {
        Self {
            max_concurrent_streams: Some(100),
            ..Self::new()
        }
    }

    /// Applies a received SETTINGS payload. Unknown identifiers are
    /// ignored.
    pub(crate) fn apply(&mut self, mut payload: &[u8]) -> Result<(), SettingsError> {
        if payload.len() % 6 != 0 {
            return Err(SettingsError::FrameSize);
        }
        while let Some((ident, rest)) = payload.split_first_chunk::<2>() {
            let Some((value, rest)) = rest.split_first_chunk::<4>() else {
                return Err(SettingsError::FrameSize);
            };
            let ident = u16::from_be_bytes(*ident);
            let value = u32::from_be_bytes(*value);
            match ident {
                1 => self.header_table_size = value,
                2 => match value {
                    0 => self.enable_push = false,
                    1 => self.enable_push = true,
                    _ => return Err(SettingsError::NonBoolPushValue),
                },
                3 => self.max_concurrent_streams = Some(value),
                4 => {
                    if value > 0x7fff_ffff {
                        return Err(SettingsError::WindowOverflow);
                    }
                    self.initial_window_size = value;
                }
                5 => {
                    if !(16384..=16_777_215).contains(&value) {
                        return Err(SettingsError::BadFrameSize);
                    }
                    self.max_frame_size = value;
                }
                _ => {}
            }
            payload = rest;
        }
        Ok(())
    }

    /// Encodes this endpoint's SETTINGS payload.
    pub(crate) fn encode(&self, out: &mut bytes::BytesMut) {
        let mut put = |ident: u16, value: u32| {
            out.put_u16(ident);
            out.put_u32(value);
        };
        put(1, self.header_table_size);
        put(2, self.enable_push as u32);
        if let Some(max) = self.max_concurrent_streams {
            put(3, max);
        }
        put(4, self.initial_window_size);
        put(5, self.max_frame_size);
    }
}

/// An invalid SETTINGS frame, a connection error.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SettingsError {
    /// Length not a multiple of six octets.
    FrameSize,
    /// SETTINGS_ENABLE_PUSH other than 0 or 1.
    NonBoolPushValue,
    /// SETTINGS_INITIAL_WINDOW_SIZE above 2^31-1.
    WindowOverflow,
    /// SETTINGS_MAX_FRAME_SIZE outside its legal range.
    BadFrameSize,
}

impl SettingsError {
    fn message(&self) -> &'static str {
        match self {
            SettingsError::FrameSize => "settings frame length not a multiple of 6",
            SettingsError::NonBoolPushValue => "non boolean server push value",
            SettingsError::WindowOverflow => "initial window size above 2^31-1",
            SettingsError::BadFrameSize => "max frame size outside legal range",
        }
    }
}

impl std::error::Error for SettingsError {}

impl std::fmt::Display for SettingsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

// ===== Test =====
