#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use webjudge::browser::{BrowserError, BrowserHandle, BrowserLauncher, PageHandle};
use webjudge::channel::{DispatchError, PendingReplies, PendingReply, TaskDispatcher};
use webjudge::database::{JudgeRecord, RecordStore};
use webjudge::sandbox::ReferenceLoader;
use webjudge::storage::ArtifactStore;
use webjudge::target::{ContainerRuntime, ContainerSpec};
use webjudge::task::{JudgeReply, Task};

/// Encodes a solid-color PNG
pub fn solid_png(width: u32, height: u32, rgba: [u8; 4]) -> Vec<u8> {
    let image = image::RgbaImage::from_pixel(width, height, image::Rgba(rgba));
    let mut bytes = Cursor::new(Vec::new());
    image
        .write_to(&mut bytes, image::ImageFormat::Png)
        .unwrap();
    bytes.into_inner()
}

#[derive(Default)]
pub struct FakePage {
    pub screenshot: Vec<u8>,
    pub texts: HashMap<String, String>,
    pub clicks: Mutex<Vec<String>>,
}

#[async_trait]
impl PageHandle for FakePage {
    async fn goto(&self, _url: &str) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn url(&self) -> Result<Option<String>, BrowserError> {
        Ok(Some("http://target:8080/".to_string()))
    }

    async fn screenshot(&self) -> Result<Vec<u8>, BrowserError> {
        Ok(self.screenshot.clone())
    }

    async fn content(&self) -> Result<String, BrowserError> {
        Ok("<html><body><h1>Hello</h1></body></html>".to_string())
    }

    async fn evaluate(&self, _expression: &str) -> Result<serde_json::Value, BrowserError> {
        Ok(serde_json::json!({"count": 3, "items": ["a", "b"]}))
    }

    async fn inner_text(&self, selector: &str) -> Result<Option<String>, BrowserError> {
        Ok(self.texts.get(selector).cloned())
    }

    async fn click(&self, selector: &str) -> Result<(), BrowserError> {
        self.clicks.lock().push(selector.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<(), BrowserError> {
        Ok(())
    }
}

/// Launches browsers whose pages all show `<h1>Hello</h1>`
#[derive(Default)]
pub struct FakeLauncher {
    pub launched: AtomicUsize,
}

pub struct FakeBrowser;

#[async_trait]
impl BrowserHandle for FakeBrowser {
    async fn is_alive(&self) -> bool {
        true
    }

    async fn new_page(&self) -> Result<Box<dyn PageHandle>, BrowserError> {
        let mut page = FakePage {
            screenshot: solid_png(4, 4, [255, 255, 255, 255]),
            ..FakePage::default()
        };
        page.texts.insert("h1".to_string(), "Hello".to_string());
        Ok(Box::new(page))
    }

    async fn close(&self) {}
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    async fn launch(&self) -> Result<Arc<dyn BrowserHandle>, BrowserError> {
        self.launched.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeBrowser))
    }
}

#[derive(Default)]
pub struct FakeReferences {
    pub images: HashMap<String, Vec<u8>>,
}

#[async_trait]
impl ReferenceLoader for FakeReferences {
    async fn load(&self, locator: &str) -> anyhow::Result<Vec<u8>> {
        self.images
            .get(locator)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no reference at {locator}"))
    }
}

/// Container runtime that never touches docker
pub struct FakeContainers {
    /// Whether the container ever prints the ready marker
    pub ready: bool,
    pub started: Mutex<Vec<ContainerSpec>>,
    pub stopped: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
    /// Names currently taken, as the engine would see them
    pub running: Mutex<HashSet<String>>,
    pub networks: Mutex<Vec<String>>,
    // Keeps never-ready containers "running" until the test ends
    silent: Mutex<Vec<mpsc::Sender<String>>>,
}

impl FakeContainers {
    pub fn new(ready: bool) -> Arc<Self> {
        Arc::new(Self {
            ready,
            started: Mutex::new(Vec::new()),
            stopped: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            running: Mutex::new(HashSet::new()),
            networks: Mutex::new(Vec::new()),
            silent: Mutex::new(Vec::new()),
        })
    }

    pub fn mounted_dirs(&self) -> Vec<PathBuf> {
        self.started
            .lock()
            .iter()
            .map(|spec| spec.mount_source.clone())
            .collect()
    }
}

#[async_trait]
impl ContainerRuntime for FakeContainers {
    async fn network_exists(&self, name: &str) -> anyhow::Result<bool> {
        Ok(self.networks.lock().iter().any(|n| n == name))
    }

    async fn create_network(&self, name: &str) -> anyhow::Result<()> {
        self.networks.lock().push(name.to_string());
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> anyhow::Result<()> {
        self.networks.lock().retain(|n| n != name);
        Ok(())
    }

    async fn start(&self, spec: &ContainerSpec) -> anyhow::Result<mpsc::Receiver<String>> {
        if !self.running.lock().insert(spec.name.clone()) {
            anyhow::bail!("Conflict. The container name {:?} is already in use", spec.name);
        }
        self.started.lock().push(spec.clone());
        let (tx, rx) = mpsc::channel(8);
        tx.send("> static server starting".to_string()).await?;
        if self.ready {
            tx.send("Ready on port 8080".to_string()).await?;
        } else {
            self.silent.lock().push(tx);
        }
        Ok(rx)
    }

    async fn stop(&self, name: &str) -> anyhow::Result<()> {
        self.running.lock().remove(name);
        self.stopped.lock().push(name.to_string());
        Ok(())
    }

    async fn remove(&self, name: &str) -> anyhow::Result<()> {
        self.running.lock().remove(name);
        self.removed.lock().push(name.to_string());
        Ok(())
    }
}

pub type Responder = Box<dyn Fn(&Task) -> Option<JudgeReply> + Send + Sync>;

/// Answers tasks through a real correlation registry
pub struct FakeDispatcher {
    pub pending: Arc<PendingReplies>,
    pub sent: Mutex<Vec<Task>>,
    respond: Responder,
}

impl FakeDispatcher {
    pub fn new(respond: Responder) -> Arc<Self> {
        Arc::new(Self {
            pending: Arc::new(PendingReplies::new()),
            sent: Mutex::new(Vec::new()),
            respond,
        })
    }
}

#[async_trait]
impl TaskDispatcher for FakeDispatcher {
    async fn send(&self, task: &Task) -> Result<PendingReply, DispatchError> {
        let waiter = self.pending.register(task.judge_record_id)?;
        self.sent.lock().push(task.clone());
        if let Some(reply) = (self.respond)(task) {
            let pending = Arc::clone(&self.pending);
            tokio::spawn(async move {
                pending.resolve(reply);
            });
        }
        Ok(waiter)
    }
}

#[derive(Default)]
pub struct MemoryArtifacts {
    pub files: Mutex<BTreeMap<String, Vec<u8>>>,
    /// Every save fails while set
    pub broken: AtomicBool,
    saves: AtomicUsize,
}

#[async_trait]
impl ArtifactStore for MemoryArtifacts {
    async fn save(&self, bytes: &[u8], suggested_name: &str) -> anyhow::Result<String> {
        if self.broken.load(Ordering::SeqCst) {
            anyhow::bail!("artifact storage unavailable");
        }
        let n = self.saves.fetch_add(1, Ordering::SeqCst);
        let id = format!("{n}-{suggested_name}");
        self.files.lock().insert(id.clone(), bytes.to_vec());
        Ok(id)
    }

    fn url(&self, id: &str) -> String {
        format!("mem://{id}")
    }
}

#[derive(Default)]
pub struct MemoryRecords {
    pub records: Mutex<Vec<JudgeRecord>>,
    pub references: Mutex<HashMap<i64, HashMap<String, String>>>,
    /// The next save fails, later ones succeed
    pub fail_next_save: AtomicBool,
}

#[async_trait]
impl RecordStore for MemoryRecords {
    async fn save(&self, record: &JudgeRecord) -> anyhow::Result<bool> {
        if self.fail_next_save.swap(false, Ordering::SeqCst) {
            anyhow::bail!("record store is locked");
        }
        let mut records = self.records.lock();
        let first = !records
            .iter()
            .any(|r| r.judge_record_id == record.judge_record_id);
        records.push(record.clone());
        Ok(first)
    }

    async fn references(&self, problem_id: i64) -> anyhow::Result<HashMap<String, String>> {
        Ok(self
            .references
            .lock()
            .get(&problem_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn replace_references(
        &self,
        problem_id: i64,
        references: &HashMap<String, String>,
    ) -> anyhow::Result<()> {
        self.references
            .lock()
            .insert(problem_id, references.clone());
        Ok(())
    }
}
