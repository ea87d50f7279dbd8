use std::rc::Rc;

use rhai::{Blob, Dynamic};

use super::system::{Host, ScriptResult};

/// Restricted view of the live page given to grading scripts.
///
/// Navigation is deliberately absent so a script cannot point the sandboxed
/// page somewhere else.
#[derive(Clone)]
pub struct ScriptPage {
    host: Rc<Host>,
}

impl ScriptPage {
    pub(super) fn new(host: Rc<Host>) -> Self {
        Self { host }
    }

    fn screenshot(&mut self) -> ScriptResult<Blob> {
        self.host.block_on(self.host.page.screenshot())
    }

    fn content(&mut self) -> ScriptResult<String> {
        self.host.block_on(self.host.page.content())
    }

    fn evaluate(&mut self, expression: &str) -> ScriptResult<Dynamic> {
        let value = self.host.block_on(self.host.page.evaluate(expression))?;
        rhai::serde::to_dynamic(value)
    }

    fn text(&mut self, selector: &str) -> ScriptResult<Dynamic> {
        let text = self.host.block_on(self.host.page.inner_text(selector))?;
        Ok(text.map(Dynamic::from).unwrap_or(Dynamic::UNIT))
    }

    fn click(&mut self, selector: &str) -> ScriptResult<()> {
        self.host.block_on(self.host.page.click(selector))
    }

    fn url(&mut self) -> ScriptResult<Dynamic> {
        let url = self.host.block_on(self.host.page.url())?;
        Ok(url.map(Dynamic::from).unwrap_or(Dynamic::UNIT))
    }
}

pub(super) fn register(engine: &mut rhai::Engine) {
    engine
        .register_type_with_name::<ScriptPage>("Page")
        .register_fn("screenshot", ScriptPage::screenshot)
        .register_fn("content", ScriptPage::content)
        .register_fn("evaluate", ScriptPage::evaluate)
        .register_fn("text", ScriptPage::text)
        .register_fn("click", ScriptPage::click)
        .register_fn("url", ScriptPage::url);
}
