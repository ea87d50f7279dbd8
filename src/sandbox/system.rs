use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use rhai::{Blob, Dynamic, EvalAltResult, FLOAT, FnPtr, ImmutableString, Map, NativeCallContext, Position};
use tokio::runtime::Handle;

use super::ReferenceLoader;
use super::image_diff;
use crate::browser::PageHandle;
use crate::task::Mode;

pub(super) type ScriptResult<T> = Result<T, Box<EvalAltResult>>;

/// Host-side resources shared by the objects handed to a script.
pub(super) struct Host {
    pub handle: Handle,
    pub deadline: Instant,
    pub page: Arc<dyn PageHandle>,
    pub references: Arc<dyn ReferenceLoader>,
    pub image_cap: usize,
    pub mode: Mode,
    pub info: HashMap<String, String>,
}

impl Host {
    /// Drives an async host call from the script thread, bounded by the task deadline
    pub fn block_on<T, E: Display>(&self, fut: impl Future<Output = Result<T, E>>) -> ScriptResult<T> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        match self.handle.block_on(tokio::time::timeout(remaining, fut)) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.to_string().into()),
            Err(_) => Err(Box::new(EvalAltResult::ErrorTerminated(
                "host call exceeded the task deadline".into(),
                Position::NONE,
            ))),
        }
    }
}

pub(super) fn to_number(value: &Dynamic) -> Option<f64> {
    value
        .as_float()
        .ok()
        .or_else(|| value.as_int().ok().map(|i| i as f64))
}

/// Like [`to_number`] but rejects infinities and NaN, which cannot be scored
pub(super) fn finite_number(value: &Dynamic, what: &str) -> Result<f64, String> {
    let n = to_number(value).ok_or_else(|| format!("{what} must be a number"))?;
    if !n.is_finite() {
        return Err(format!("{what} must be finite, got {n}"));
    }
    Ok(n)
}

fn is_truthy(value: &Dynamic) -> bool {
    if value.is_unit() {
        return false;
    }
    if let Ok(b) = value.as_bool() {
        return b;
    }
    if let Some(n) = to_number(value) {
        return n != 0.0 && !n.is_nan();
    }
    if let Some(s) = value.read_lock::<ImmutableString>() {
        return !s.is_empty();
    }
    true
}

pub(super) struct CheckPoint {
    pub name: String,
    pub total_score: f64,
    pub handler: FnPtr,
}

#[derive(Default)]
struct SystemState {
    checkpoints: Vec<CheckPoint>,
    /// Files produced by the running checkpoint; `None` outside of one
    files: Option<BTreeMap<String, Vec<u8>>>,
    images: usize,
}

/// The `system` object a grading script receives.
#[derive(Clone)]
pub struct System {
    host: Rc<Host>,
    state: Rc<RefCell<SystemState>>,
}

impl System {
    pub(super) fn new(host: Rc<Host>) -> Self {
        Self {
            host,
            state: Rc::default(),
        }
    }

    pub(super) fn take_checkpoints(&self) -> Vec<CheckPoint> {
        std::mem::take(&mut self.state.borrow_mut().checkpoints)
    }

    pub(super) fn begin_checkpoint(&self) {
        self.state.borrow_mut().files = Some(BTreeMap::new());
    }

    pub(super) fn end_checkpoint(&self) -> BTreeMap<String, Vec<u8>> {
        self.state.borrow_mut().files.take().unwrap_or_default()
    }

    fn mode(&mut self) -> String {
        match self.host.mode {
            Mode::Audit => "audit".to_string(),
            Mode::Judge => "judge".to_string(),
        }
    }

    fn info(&mut self) -> Map {
        self.host
            .info
            .iter()
            .map(|(k, v)| (k.as_str().into(), Dynamic::from(v.clone())))
            .collect()
    }

    fn define_checkpoint(&mut self, name: &str, total_score: Dynamic, handler: FnPtr) -> ScriptResult<()> {
        let total_score =
            finite_number(&total_score, &format!("total score of checkpoint {name:?}"))?;
        self.state.borrow_mut().checkpoints.push(CheckPoint {
            name: name.to_string(),
            total_score,
            handler,
        });
        Ok(())
    }

    fn expect(&mut self, predicate: Dynamic, description: &str) -> ScriptResult<()> {
        if is_truthy(&predicate) {
            Ok(())
        } else {
            Err(format!("expectation failed: {description}").into())
        }
    }

    fn score(ctx: NativeCallContext, _: &mut Self, total_score: Dynamic, rating: FnPtr) -> ScriptResult<FLOAT> {
        let total_score = finite_number(&total_score, "total score")?;
        let rating = rating.call_within_context::<Dynamic>(&ctx, ())?;
        let rating = to_number(&rating).ok_or_else(|| "rating must return a number".to_string())?;
        let rating = if rating.is_nan() { 0.0 } else { rating.clamp(0.0, 1.0) };
        Ok(rating * total_score)
    }

    fn save_or_compare(&mut self, options: Map) -> ScriptResult<FLOAT> {
        let kind = options
            .get("type")
            .and_then(|t| t.clone().try_cast::<ImmutableString>())
            .unwrap_or_default();
        if kind != "image" {
            return Err(format!("unsupported artifact type {:?}", kind.as_str()).into());
        }
        let buffer = options
            .get("buffer")
            .and_then(|b| b.clone().try_cast::<Blob>())
            .ok_or_else(|| "buffer must be a blob".to_string())?;
        if buffer.len() > self.host.image_cap {
            return Err(format!(
                "image of {} bytes exceeds the {} byte cap",
                buffer.len(),
                self.host.image_cap
            )
            .into());
        }
        if self.state.borrow().files.is_none() {
            return Err("save_or_compare can only be called inside a checkpoint".into());
        }

        let name = {
            let mut state = self.state.borrow_mut();
            state.images += 1;
            let name = options
                .get("name")
                .and_then(|n| n.clone().try_cast::<ImmutableString>())
                .map(|n| n.to_string())
                .unwrap_or_else(|| format!("image-{}", state.images));
            if name.contains('.') { name } else { format!("{name}.png") }
        };

        let score = match self.host.mode {
            Mode::Audit => 1.0,
            Mode::Judge => {
                let locator = self
                    .host
                    .info
                    .get(&name)
                    .ok_or_else(|| format!("no reference image recorded for {name:?}"))?;
                let reference = self.host.block_on(self.host.references.load(locator))?;
                image_diff::similarity(&reference, &buffer, image_diff::DEFAULT_THRESHOLD)
                    .map_err(|e| format!("cannot compare image {name:?}: {e}"))?
            }
        };

        if let Some(files) = self.state.borrow_mut().files.as_mut() {
            files.insert(name, buffer);
        }
        Ok(score)
    }
}

/// Accumulating score handed to each checkpoint handler as `ctx`.
#[derive(Clone, Default)]
pub struct Scorer {
    value: Rc<Cell<f64>>,
}

impl Scorer {
    pub(super) fn get(&self) -> f64 {
        self.value.get()
    }

    pub(super) fn set_value(&self, value: f64) {
        self.value.set(value);
    }

    fn add(&mut self, delta: Dynamic) -> ScriptResult<()> {
        let delta = finite_number(&delta, "score")?;
        let sum = self.value.get() + delta;
        if !sum.is_finite() {
            return Err(format!("score overflowed adding {delta}").into());
        }
        self.value.set(sum);
        Ok(())
    }

    fn set(&mut self, value: Dynamic) -> ScriptResult<()> {
        let value = finite_number(&value, "score")?;
        self.value.set(value);
        Ok(())
    }

    fn value(&mut self) -> FLOAT {
        self.value.get()
    }
}

pub(super) fn register(engine: &mut rhai::Engine) {
    engine
        .register_type_with_name::<System>("System")
        .register_get("mode", System::mode)
        .register_get("info", System::info)
        .register_fn("define_checkpoint", System::define_checkpoint)
        .register_fn("expect", System::expect)
        .register_fn("score", System::score)
        .register_fn("save_or_compare", System::save_or_compare);

    engine
        .register_type_with_name::<Scorer>("Scorer")
        .register_fn("add", Scorer::add)
        .register_fn("set", Scorer::set)
        .register_fn("value", Scorer::value);
}
