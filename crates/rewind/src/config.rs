//! Runner configuration.
//!
//! [`Settings`] are plain tunables and deserialize from TOML or JSON.
//! [`RunnerConfig`] adds the capability objects a program can call; there is
//! no global builtin table.

use crate::capability::{Builtins, Capability, Frame, RenderSignal};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Settings {
    /// Capture a keyframe every N steps; 0 keeps only the step-0 keyframe.
    pub keyframe_interval: u64,
    /// Oldest keyframes beyond this count are evicted (step 0 is kept).
    pub keyframe_limit: usize,
    /// Run a cycle collection every N steps; 0 collects only at completion.
    pub gc_interval: u64,
    /// Record a checkpoint before every named-function call.
    pub record_checkpoints: bool,
    /// Include [`Builtins`] and the `(render)` frame capability.
    pub standard_builtins: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            keyframe_interval: 1000,
            keyframe_limit: 64,
            gc_interval: 4096,
            record_checkpoints: true,
            standard_builtins: true,
        }
    }
}

#[derive(Clone)]
pub struct RunnerConfig {
    pub settings: Settings,
    /// Searched last to first, so later capabilities shadow earlier ones.
    pub capabilities: Vec<Rc<dyn Capability>>,
    pub render: RenderSignal,
}

impl RunnerConfig {
    pub fn new(settings: Settings) -> Self {
        let render = RenderSignal::default();
        let mut capabilities: Vec<Rc<dyn Capability>> = Vec::new();
        if settings.standard_builtins {
            capabilities.push(Rc::new(Builtins));
            capabilities.push(Rc::new(Frame::new(render.clone())));
        }
        Self {
            settings,
            capabilities,
            render,
        }
    }

    pub fn with_capability(mut self, capability: Rc<dyn Capability>) -> Self {
        self.capabilities.push(capability);
        self
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

impl fmt::Debug for RunnerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels: Vec<_> = self
            .capabilities
            .iter()
            .map(|capability| capability.label())
            .collect();
        f.debug_struct("RunnerConfig")
            .field("settings", &self.settings)
            .field("capabilities", &labels)
            .finish()
    }
}
