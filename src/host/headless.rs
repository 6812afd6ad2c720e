//! Headless QuickJS page
//!
//! Emulates the parts of a browser page the injection pipeline relies on:
//! two JavaScript worlds (isolated and page) sharing one document element,
//! a document element that only appears after a number of lookups, and
//! `<script>` nodes that run their text in the page world when appended.
//!
//! QuickJS runtimes are not `Send`, so both worlds live on a dedicated
//! thread and requests reach it over a channel.

use async_trait::async_trait;
use rquickjs::{Coerced, Context, Ctx, Function, Runtime};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use url::Url;

use super::{ExecutionContext, HostError, PageHost};
use crate::syntax::exception_message;

const ISOLATED_SHIM: &str = r#"
globalThis.window = globalThis;
globalThis.top = __isSubframe ? {} : globalThis;
var location = { href: __url };
var console = { log: function () { __log(Array.prototype.join.call(arguments, ' ')); } };
console.info = console.warn = console.error = console.debug = console.log;
var __root = {
  tagName: 'HTML',
  appendChild: function (node) {
    if (node && node.tagName === 'SCRIPT') {
      node.parentNode = __root;
      __attach(String(node.textContent));
    }
    return node;
  },
  removeChild: function (node) { if (node) { node.parentNode = null; } return node; },
  setAttribute: function (name, value) { __setAttr(String(name), String(value)); },
  getAttribute: function (name) { var v = __getAttr(String(name)); return v == null ? null : v; },
  hasAttribute: function (name) { return __getAttr(String(name)) != null; },
  removeAttribute: function (name) { __removeAttr(String(name)); }
};
var document = {
  get documentElement() { return __anchorReady() ? __root : null; },
  createElement: function (tag) {
    var node = { tagName: String(tag).toUpperCase(), textContent: '', parentNode: null };
    node.remove = function () { if (node.parentNode) { node.parentNode.removeChild(node); } };
    return node;
  }
};
"#;

const PAGE_SHIM: &str = r#"
globalThis.window = globalThis;
globalThis.top = globalThis;
var location = { href: __url };
var console = { log: function () { __log(Array.prototype.join.call(arguments, ' ')); } };
console.info = console.warn = console.error = console.debug = console.log;
var document = {
  documentElement: {
    tagName: 'HTML',
    setAttribute: function (name, value) { __setAttr(String(name), String(value)); },
    getAttribute: function (name) { var v = __getAttr(String(name)); return v == null ? null : v; },
    hasAttribute: function (name) { return __getAttr(String(name)) != null; },
    removeAttribute: function (name) { __removeAttr(String(name)); }
  }
};
function fetch(url) { return 'page-fetch:' + url; }
"#;

/// Options fixed for the lifetime of a [`HeadlessPage`]
#[derive(Debug, Clone, Copy)]
struct PageOptions {
    /// Number of `documentElement` lookups that see `null` after navigation
    anchor_delay: u32,
    subframe: bool,
}

enum Request {
    Navigate {
        url: String,
        reply: oneshot::Sender<Result<(), HostError>>,
    },
    Evaluate {
        context: ExecutionContext,
        script: String,
        reply: oneshot::Sender<Result<String, HostError>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// A [`PageHost`] backed by QuickJS
pub struct HeadlessPage {
    requests: mpsc::Sender<Request>,
    navigations: Arc<AtomicUsize>,
}

impl HeadlessPage {
    /// Page whose document element appears after two lookups
    pub fn new() -> Result<Self, HostError> {
        Self::spawn(PageOptions {
            anchor_delay: 2,
            subframe: false,
        })
    }

    pub fn with_anchor_delay(anchor_delay: u32) -> Result<Self, HostError> {
        Self::spawn(PageOptions {
            anchor_delay,
            subframe: false,
        })
    }

    /// Page whose document element never appears
    pub fn without_anchor() -> Result<Self, HostError> {
        Self::with_anchor_delay(u32::MAX)
    }

    /// Page that reports itself as a nested frame
    pub fn as_subframe() -> Result<Self, HostError> {
        Self::spawn(PageOptions {
            anchor_delay: 0,
            subframe: true,
        })
    }

    fn spawn(options: PageOptions) -> Result<Self, HostError> {
        let (requests, receiver) = mpsc::channel();
        std::thread::Builder::new()
            .name("headless-page".to_string())
            .spawn(move || serve(receiver, options))
            .map_err(|e| {
                warn!("Failed to start headless page thread: {}", e);
                HostError::Unavailable
            })?;

        Ok(Self {
            requests,
            navigations: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Number of successful navigations so far
    pub fn navigations(&self) -> usize {
        self.navigations.load(Ordering::SeqCst)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T, HostError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(make(reply))
            .map_err(|_| HostError::Unavailable)?;
        response.await.map_err(|_| HostError::Unavailable)
    }
}

#[async_trait]
impl PageHost for HeadlessPage {
    async fn navigate(&self, url: &Url) -> Result<(), HostError> {
        let url = url.to_string();
        self.request(|reply| Request::Navigate { url, reply })
            .await??;
        self.navigations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn evaluate(&self, context: ExecutionContext, script: &str) -> Result<String, HostError> {
        let script = script.to_string();
        self.request(|reply| Request::Evaluate {
            context,
            script,
            reply,
        })
        .await?
    }

    async fn close(&self) -> Result<(), HostError> {
        self.request(|reply| Request::Close { reply }).await
    }
}

fn serve(requests: mpsc::Receiver<Request>, options: PageOptions) {
    let mut page: Option<Worlds> = None;

    while let Ok(request) = requests.recv() {
        match request {
            Request::Navigate { url, reply } => {
                page = None;
                let result = Worlds::load(&url, options).map(|worlds| {
                    page = Some(worlds);
                });
                let _ = reply.send(result);
            }
            Request::Evaluate {
                context,
                script,
                reply,
            } => {
                let result = match page.as_ref() {
                    Some(worlds) => worlds.evaluate(context, &script),
                    None => Err(HostError::NotNavigated),
                };
                let _ = reply.send(result);
            }
            Request::Close { reply } => {
                page = None;
                let _ = reply.send(());
            }
        }
    }
    debug!("Headless page thread stopped");
}

/// The two JavaScript worlds of one loaded page
struct Worlds {
    isolated: Context,
    page: Context,
    _isolated_rt: Runtime,
    _page_rt: Runtime,
}

type Attributes = Rc<RefCell<HashMap<String, String>>>;

impl Worlds {
    fn load(url: &str, options: PageOptions) -> Result<Self, HostError> {
        let navigation = |message: String| HostError::Navigation {
            url: url.to_string(),
            message,
        };

        let page_rt = Runtime::new().map_err(|e| navigation(format!("runtime new: {}", e)))?;
        let page =
            Context::full(&page_rt).map_err(|e| navigation(format!("context create: {}", e)))?;
        let isolated_rt = Runtime::new().map_err(|e| navigation(format!("runtime new: {}", e)))?;
        let isolated =
            Context::full(&isolated_rt).map_err(|e| navigation(format!("context create: {}", e)))?;

        let attributes: Attributes = Rc::new(RefCell::new(HashMap::new()));

        page.with(|ctx| -> Result<(), rquickjs::Error> {
            let global = ctx.globals();
            global.set("__url", url)?;
            install_common(&ctx, attributes.clone(), "page")?;
            ctx.eval::<(), _>(PAGE_SHIM)
        })
        .map_err(|e| navigation(format!("page world: {}", e)))?;

        let page_for_attach = page.clone();
        let remaining = Rc::new(Cell::new(options.anchor_delay));
        isolated
            .with(|ctx| -> Result<(), rquickjs::Error> {
                let global = ctx.globals();
                global.set("__url", url)?;
                global.set("__isSubframe", options.subframe)?;
                install_common(&ctx, attributes.clone(), "isolated")?;

                let anchor_ready = Function::new(
                    ctx.clone(),
                    move |_c: rquickjs::Ctx<'_>| -> Result<bool, rquickjs::Error> {
                        let left = remaining.get();
                        if left == 0 {
                            return Ok(true);
                        }
                        remaining.set(left - 1);
                        Ok(false)
                    },
                )?;
                global.set("__anchorReady", anchor_ready)?;

                let attach = Function::new(
                    ctx.clone(),
                    move |_c: rquickjs::Ctx<'_>, source: String| -> Result<(), rquickjs::Error> {
                        let failure = page_for_attach.with(|page_ctx| {
                            page_ctx
                                .eval::<(), _>(source.as_str())
                                .err()
                                .map(|e| exception_message(&page_ctx, e))
                        });
                        if let Some(message) = failure {
                            debug!("Script node raised in page world: {}", message);
                        }
                        Ok(())
                    },
                )?;
                global.set("__attach", attach)?;

                ctx.eval::<(), _>(ISOLATED_SHIM)
            })
            .map_err(|e| navigation(format!("isolated world: {}", e)))?;

        debug!(url = %url, "Headless page loaded");
        Ok(Self {
            isolated,
            page,
            _isolated_rt: isolated_rt,
            _page_rt: page_rt,
        })
    }

    fn evaluate(&self, context: ExecutionContext, script: &str) -> Result<String, HostError> {
        let world = match context {
            ExecutionContext::Isolated => &self.isolated,
            ExecutionContext::Page => &self.page,
        };
        world.with(|ctx| match ctx.eval::<Coerced<String>, _>(script) {
            Ok(value) => Ok(value.0),
            Err(e) => Err(HostError::Evaluation(exception_message(&ctx, e))),
        })
    }
}

/// Attribute accessors on the shared document element, and logging
fn install_common(
    ctx: &Ctx<'_>,
    attributes: Attributes,
    world: &'static str,
) -> Result<(), rquickjs::Error> {
    let global = ctx.globals();

    let attrs = attributes.clone();
    let set_attr = Function::new(
        ctx.clone(),
        move |_c: rquickjs::Ctx<'_>, name: String, value: String| -> Result<(), rquickjs::Error> {
            attrs.borrow_mut().insert(name, value);
            Ok(())
        },
    )?;
    global.set("__setAttr", set_attr)?;

    let attrs = attributes.clone();
    let get_attr = Function::new(
        ctx.clone(),
        move |_c: rquickjs::Ctx<'_>, name: String| -> Result<Option<String>, rquickjs::Error> {
            Ok(attrs.borrow().get(&name).cloned())
        },
    )?;
    global.set("__getAttr", get_attr)?;

    let remove_attr = Function::new(
        ctx.clone(),
        move |_c: rquickjs::Ctx<'_>, name: String| -> Result<(), rquickjs::Error> {
            attributes.borrow_mut().remove(&name);
            Ok(())
        },
    )?;
    global.set("__removeAttr", remove_attr)?;

    let log = Function::new(
        ctx.clone(),
        move |_c: rquickjs::Ctx<'_>, msg: String| -> Result<(), rquickjs::Error> {
            debug!(world, "console: {}", msg);
            Ok(())
        },
    )?;
    global.set("__log", log)?;

    Ok(())
}
