use serde::Deserialize;

/// Settings for one [`BlastBufferQueue`](crate::BlastBufferQueue).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BlastConfig {
    /// Base name; the queue appends `#<id>`.
    pub name: String,
    /// Buffers the compositor may hold per layer at its highest refresh rate.
    pub max_acquired_buffers: usize,
    /// Send the window size as the destination frame with every buffer.
    pub update_destination_frame: bool,
}

impl Default for BlastConfig {
    fn default() -> Self {
        Self {
            name: "blast".to_owned(),
            max_acquired_buffers: 1,
            update_destination_frame: true,
        }
    }
}
