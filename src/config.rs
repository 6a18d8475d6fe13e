//! Connection-level configuration, mirroring the teacher's `client::Builder`.

/// Local flow-control window and SETTINGS values applied at handshake time.
///
/// The defaults are a 32 MiB connection window and stream window, a 64 KiB
/// HPACK dynamic table, and PUSH disabled (client-side push acceptance is a
/// declared Non-goal, enforced by `Builder::enable_push` below rather than
/// by this struct's field).
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) initial_window_size: u32,
    pub(crate) header_table_size: u32,
    pub(crate) enable_push: bool,
    pub(crate) local_connection_window: u32,
}

/// 32 MiB, the local window the engine advertises at handshake.
pub const DEFAULT_WINDOW_SIZE: u32 = 32 * 1024 * 1024;

/// The HPACK dynamic table size advertised at handshake.
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 65_536;

impl Default for Config {
    fn default() -> Self {
        Config {
            initial_window_size: DEFAULT_WINDOW_SIZE,
            header_table_size: DEFAULT_HEADER_TABLE_SIZE,
            enable_push: false,
            local_connection_window: DEFAULT_WINDOW_SIZE,
        }
    }
}

/// Builds a [`Config`].
///
/// Push is always disabled regardless of what the caller requests: HTTP/2
/// PUSH acceptance is out of scope for this engine.
#[derive(Debug, Clone, Default)]
pub struct Builder {
    config: Config,
}

impl Builder {
    pub fn new() -> Self {
        Builder::default()
    }

    /// Sets `SETTINGS_INITIAL_WINDOW_SIZE` and the per-stream local window.
    pub fn initial_window_size(&mut self, size: u32) -> &mut Self {
        self.config.initial_window_size = size;
        self
    }

    /// Sets `SETTINGS_HEADER_TABLE_SIZE`.
    pub fn header_table_size(&mut self, size: u32) -> &mut Self {
        self.config.header_table_size = size;
        self
    }

    /// Sets the connection-wide local flow-control window.
    pub fn local_connection_window(&mut self, size: u32) -> &mut Self {
        self.config.local_connection_window = size;
        self
    }

    /// No-op: push is always disabled regardless of `enabled`. Kept so
    /// callers migrating from a codec binding that does support server
    /// push have a stable call site. `Config::enable_push` is still
    /// forwarded to `h2::client::Builder::enable_push` at handshake time
    /// (always `false`), rather than the handshake hardcoding the literal
    /// itself, so there's one place this policy lives.
    pub fn enable_push(&mut self, _enabled: bool) -> &mut Self {
        self.config.enable_push = false;
        self
    }

    pub fn build(&self) -> Config {
        self.config.clone()
    }
}
