//! Scene-tool synchronisation hook.
//!
//! A scene composition tool wants one browser source per connected emitter,
//! pointing at that emitter's receiver URL. The relay only reports which ids
//! are active and what their URLs are; driving the tool is up to the
//! [`SceneSync`] implementation.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use tokio::sync::watch;

use crate::signal::Signal;

/// Receives emitter additions; removal happens through the returned handle.
pub trait SceneSync: Send + Sync + 'static {
    fn add_id(&self, id: &str, url: &str) -> SceneHandle;
}

/// Removes a scene entry when [`SceneHandle::remove`] is called.
pub struct SceneHandle {
    on_remove: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl SceneHandle {
    pub fn new(on_remove: impl FnOnce() + Send + 'static) -> Self {
        Self {
            on_remove: Mutex::new(Some(Box::new(on_remove))),
        }
    }

    pub fn noop() -> Self {
        Self {
            on_remove: Mutex::new(None),
        }
    }

    pub fn remove(&self) {
        let on_remove = self.on_remove.lock().take();
        if let Some(on_remove) = on_remove {
            on_remove();
        }
    }
}

/// Default hook: log additions and removals.
pub struct LogSceneSync;

impl SceneSync for LogSceneSync {
    fn add_id(&self, id: &str, url: &str) -> SceneHandle {
        let short = crate::ids::short_id(id);
        log::info!("Scene source added for emitter {short}");
        log::debug!("Scene source URL: {url}");
        SceneHandle::new(move || log::info!("Scene source removed for emitter {short}"))
    }
}

/// Keeps the active id → URL map as an observable value.
#[derive(Default)]
pub struct ActiveScenes {
    scenes: std::sync::Arc<Signal<BTreeMap<String, String>>>,
}

impl ActiveScenes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.scenes.get()
    }

    pub fn subscribe(&self) -> watch::Receiver<BTreeMap<String, String>> {
        self.scenes.subscribe()
    }
}

impl SceneSync for ActiveScenes {
    fn add_id(&self, id: &str, url: &str) -> SceneHandle {
        self.scenes.modify(|scenes| {
            scenes.insert(id.to_string(), url.to_string()).as_deref() != Some(url)
        });

        let scenes = self.scenes.clone();
        let id = id.to_string();
        SceneHandle::new(move || {
            scenes.modify(|scenes| scenes.remove(&id).is_some());
        })
    }
}
