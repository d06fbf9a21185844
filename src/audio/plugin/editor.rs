//! Plugin editor sessions

use std::sync::Arc;
use std::time::Duration;

use super::{AudioError, PluginInstance, WindowHandle};

/// How often the UI must call [`EditorSession::idle`] while an editor is open
pub const EDITOR_IDLE_INTERVAL: Duration = Duration::from_millis(50);

/// An open plugin editor. Closes the editor when dropped.
///
/// Window creation belongs to the UI layer; the session only hands the
/// parent handle to the plugin and forwards idle ticks.
pub struct EditorSession {
    instance: Arc<PluginInstance>,
}

impl EditorSession {
    /// Open `instance`'s editor inside `parent`
    pub fn open(instance: Arc<PluginInstance>, parent: WindowHandle) -> Result<Self, AudioError> {
        instance.open_editor(parent)?;
        Ok(Self { instance })
    }

    pub fn instance(&self) -> &Arc<PluginInstance> {
        &self.instance
    }

    /// Forward one idle tick to the plugin
    pub fn idle(&self) {
        self.instance.editor_idle();
    }

    /// Close the editor now
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for EditorSession {
    fn drop(&mut self) {
        self.instance.close_editor();
    }
}
