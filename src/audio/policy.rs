use serde::{Deserialize, Serialize};

/// Per-guild playback preferences.
///
/// Read by the session at every decision point and persisted through the
/// store whenever a user changes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackPolicy {
    /// Nunca abandonar el canal por inactividad
    pub twenty_four_seven: bool,
    /// Abandonar el canal cuando la cola queda vacía
    pub auto_leave: bool,
    /// Pausar cuando no queda nadie escuchando
    pub auto_pause: bool,
    /// Pedir recomendaciones cuando se acaba la cola
    pub auto_queue: bool,
    /// Guardar los tracks terminados en el historial
    pub history: bool,
}

impl Default for PlaybackPolicy {
    fn default() -> Self {
        Self {
            twenty_four_seven: false,
            auto_leave: false,
            auto_pause: true,
            auto_queue: false,
            history: false,
        }
    }
}

impl PlaybackPolicy {
    /// Whether an idle, empty session should eventually be torn down.
    pub fn allows_auto_leave(&self) -> bool {
        self.auto_leave && !self.twenty_four_seven
    }

    pub fn apply(&mut self, patch: PolicyPatch) {
        if let Some(v) = patch.twenty_four_seven {
            self.twenty_four_seven = v;
        }
        if let Some(v) = patch.auto_leave {
            self.auto_leave = v;
        }
        if let Some(v) = patch.auto_pause {
            self.auto_pause = v;
        }
        if let Some(v) = patch.auto_queue {
            self.auto_queue = v;
        }
        if let Some(v) = patch.history {
            self.history = v;
        }
    }
}

/// Partial policy change coming from a user command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyPatch {
    pub twenty_four_seven: Option<bool>,
    pub auto_leave: Option<bool>,
    pub auto_pause: Option<bool>,
    pub auto_queue: Option<bool>,
    pub history: Option<bool>,
}
