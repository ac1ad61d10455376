// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The action program.
//!
//! A compiled configuration is a shared tree of immutable actions; every
//! request executes the tree against its own action stack. Execution is
//! synchronous per frame; the only yield is `WaitForEvent`, which must be
//! paired with an external wakeup re-arming the request's job. A frame's
//! context survives across yields and is cleaned up when the frame pops,
//! in reverse order on aborts.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::condition::{self, CheckResult, Condition};
use crate::error::BackendError;
use crate::options::OptionValue;
use crate::vrequest::VRequest;
use crate::worker::Worker;

/// Return values of action handlers and other per-request callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerResult {
    /// Frame is done; pop and continue.
    GoOn,
    /// Re-enter the action machine from the top of the remaining stack.
    Comeback,
    /// Yield; the handler is responsible for scheduling the request's job.
    WaitForEvent,
    /// Abort the virtual request.
    Error,
}

/// Per-frame context owned by a function or balancer handler.
pub type ActionCtx = Option<Box<dyn Any + Send>>;

/// Opaque handler invoked by `Action::Function` frames.
pub trait ActionHandler: Send + Sync {
    /// Runs the handler. A non-`None` context stored in `ctx` survives
    /// yields and is passed to [`cleanup`](Self::cleanup) when the frame
    /// pops.
    fn handle(&self, vr: &mut VRequest, wrk: &mut Worker, ctx: &mut ActionCtx) -> HandlerResult;

    /// Invoked when the frame pops with a stored context.
    fn cleanup(&self, _vr: &mut VRequest, _ctx: Box<dyn Any + Send>) {}
}

/// Selects a backend pool and attaches a connection to the request.
pub trait Balancer: Send + Sync {
    /// Attempts to select a backend.
    fn select(&self, vr: &mut VRequest, wrk: &mut Worker, ctx: &mut ActionCtx) -> HandlerResult;

    /// Invoked instead of `select` after a backend error was recorded; may
    /// try another pool or fail the request.
    fn fallback(
        &self,
        vr: &mut VRequest,
        wrk: &mut Worker,
        ctx: &mut ActionCtx,
        error: BackendError,
    ) -> HandlerResult;

    /// Invoked when the frame pops with a stored context.
    fn finished(&self, _vr: &mut VRequest, _ctx: Box<dyn Any + Send>) {}
}

/// One compiled configuration step.
pub enum Action {
    /// No-op.
    Nothing,
    /// Overwrites one option slot in the request's option vector.
    Setting {
        /// Option slot.
        ndx: usize,
        /// Value captured into the request.
        value: OptionValue,
    },
    /// Conditional jump.
    Condition {
        /// The test.
        cond: Arc<Condition>,
        /// Executed when the test holds.
        target: Option<Arc<Action>>,
        /// Executed otherwise.
        target_else: Option<Arc<Action>>,
    },
    /// Opaque handler with per-request context.
    Function(Arc<dyn ActionHandler>),
    /// Ordered sub-actions, resumable mid-list.
    List(Vec<Arc<Action>>),
    /// Backend pool selection.
    Balancer(Arc<dyn Balancer>),
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            Action::Nothing => "Action::Nothing",
            Action::Setting { .. } => "Action::Setting",
            Action::Condition { .. } => "Action::Condition",
            Action::Function(_) => "Action::Function",
            Action::List(_) => "Action::List",
            Action::Balancer(_) => "Action::Balancer",
        })
    }
}

impl Action {
    /// A no-op action.
    pub fn nothing() -> Arc<Action> {
        Arc::new(Action::Nothing)
    }

    /// An option-setting action.
    pub fn new_setting(ndx: usize, value: OptionValue) -> Arc<Action> {
        Arc::new(Action::Setting { ndx, value })
    }

    /// A conditional action.
    pub fn new_condition(
        cond: Arc<Condition>,
        target: Option<Arc<Action>>,
        target_else: Option<Arc<Action>>,
    ) -> Arc<Action> {
        Arc::new(Action::Condition {
            cond,
            target,
            target_else,
        })
    }

    /// A function action.
    pub fn new_function(handler: Arc<dyn ActionHandler>) -> Arc<Action> {
        Arc::new(Action::Function(handler))
    }

    /// An ordered list of actions.
    pub fn new_list(items: Vec<Arc<Action>>) -> Arc<Action> {
        Arc::new(Action::List(items))
    }

    /// A balancer action.
    pub fn new_balancer(balancer: Arc<dyn Balancer>) -> Arc<Action> {
        Arc::new(Action::Balancer(balancer))
    }
}

struct ActionFrame {
    act: Arc<Action>,
    pos: usize,
    ctx: ActionCtx,
}

/// Per-request stack of action frames.
#[derive(Default)]
pub struct ActionStack {
    frames: Vec<ActionFrame>,
    /// Error recorded by the backend machinery for the balancer's fallback.
    pub backend_error: Option<BackendError>,
}

impl fmt::Debug for ActionStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionStack")
            .field("depth", &self.frames.len())
            .field("backend_error", &self.backend_error)
            .finish()
    }
}

impl ActionStack {
    /// Creates an empty stack.
    pub fn new() -> Self {
        ActionStack::default()
    }

    /// Pushes `act`; it runs before anything already on the stack.
    pub fn enter(&mut self, act: Arc<Action>) {
        self.frames.push(ActionFrame {
            act,
            pos: 0,
            ctx: None,
        });
    }

    /// Whether no frames are left.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Current stack depth.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    fn peek(&self) -> Option<(Arc<Action>, usize)> {
        self.frames.last().map(|f| (f.act.clone(), f.pos))
    }

    fn advance_top(&mut self) {
        if let Some(f) = self.frames.last_mut() {
            f.pos += 1;
        }
    }

    fn take_top_ctx(&mut self) -> ActionCtx {
        self.frames.last_mut().and_then(|f| f.ctx.take())
    }

    fn put_top_ctx(&mut self, ctx: ActionCtx) {
        if let Some(f) = self.frames.last_mut() {
            f.ctx = ctx;
        }
    }
}

fn pop_frame(vr: &mut VRequest) {
    let Some(frame) = vr.action_stack.frames.pop() else {
        return;
    };
    if let Some(ctx) = frame.ctx {
        match *frame.act {
            Action::Function(ref h) => h.cleanup(vr, ctx),
            Action::Balancer(ref b) => b.finished(vr, ctx),
            _ => {}
        }
    }
}

/// Unwinds the stack in reverse order, invoking frame cleanups.
pub fn unwind(vr: &mut VRequest) {
    while !vr.action_stack.frames.is_empty() {
        pop_frame(vr);
    }
    vr.action_stack.backend_error = None;
}

/// Executes frames until the stack drains (`GoOn`), a handler yields, or an
/// error aborts the request.
pub fn execute(vr: &mut VRequest, wrk: &mut Worker) -> HandlerResult {
    loop {
        let Some((act, pos)) = vr.action_stack.peek() else {
            return HandlerResult::GoOn;
        };
        wrk.stats.actions_executed += 1;

        match *act {
            Action::Nothing => pop_frame(vr),
            Action::Setting { ndx, ref value } => {
                if ndx < vr.options.len() {
                    vr.options[ndx] = value.clone();
                }
                pop_frame(vr);
            }
            Action::List(ref items) => {
                if pos < items.len() {
                    vr.action_stack.advance_top();
                    vr.action_stack.enter(items[pos].clone());
                } else {
                    pop_frame(vr);
                }
            }
            Action::Condition {
                ref cond,
                ref target,
                ref target_else,
            } => match condition::check(cond, vr, wrk) {
                Ok(CheckResult::Value(hit)) => {
                    pop_frame(vr);
                    let next = if hit { target } else { target_else };
                    if let Some(next) = next {
                        vr.action_stack.enter(next.clone());
                    }
                }
                Ok(CheckResult::WaitForEvent) => return HandlerResult::WaitForEvent,
                Err(e) => {
                    log::error!("condition evaluation failed: {}", e);
                    return HandlerResult::Error;
                }
            },
            Action::Function(ref handler) => {
                let handler = handler.clone();
                let mut ctx = vr.action_stack.take_top_ctx();
                let res = handler.handle(vr, wrk, &mut ctx);
                vr.action_stack.put_top_ctx(ctx);
                match res {
                    HandlerResult::GoOn => pop_frame(vr),
                    HandlerResult::Comeback => continue,
                    HandlerResult::WaitForEvent | HandlerResult::Error => return res,
                }
            }
            Action::Balancer(ref balancer) => {
                let balancer = balancer.clone();
                let mut ctx = vr.action_stack.take_top_ctx();
                let res = match vr.action_stack.backend_error.take() {
                    Some(error) => balancer.fallback(vr, wrk, &mut ctx, error),
                    None => balancer.select(vr, wrk, &mut ctx),
                };
                vr.action_stack.put_top_ctx(ctx);
                match res {
                    HandlerResult::GoOn => pop_frame(vr),
                    HandlerResult::Comeback => continue,
                    HandlerResult::WaitForEvent | HandlerResult::Error => return res,
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::condition::{CompOperator, CondLValue, Condition};
    use crate::options::{OptionRegistry, OptionValue};
    use crate::parser::request::RequestHead;
    use crate::request::Request;
    use crate::server::{ServerConfig, ServerShared};
    use crate::vrequest::VRequest;
    use crate::worker::Worker;

    fn fixture(extra_slots: usize) -> (Worker, VRequest, usize) {
        let mut options = OptionRegistry::new();
        let mut first = 0;
        for i in 0..extra_slots {
            let slot = options.register(&format!("test.slot{}", i), OptionValue::Number(0));
            if i == 0 {
                first = slot;
            }
        }
        let shared = ServerShared::new(ServerConfig::default(), options, Action::nothing());
        let wrk = Worker::new(shared.clone(), 0).expect("worker construction");
        let head = RequestHead::parse(b"GET /a/b HTTP/1.1\r\nHost: h\r\n\r\n").unwrap();
        let addr = "127.0.0.1:1".parse().unwrap();
        let vr = VRequest::new(
            Request::from_head(head),
            shared.options.instantiate(),
            0,
            addr,
            addr,
        );
        (wrk, vr, first)
    }

    #[test]
    fn action_setting_captures_option_value() {
        let (mut wrk, mut vr, slot) = fixture(1);
        let root = Action::new_list(vec![Action::new_setting(slot, OptionValue::Number(42))]);
        vr.enter_action(root);
        assert_eq!(HandlerResult::GoOn, execute(&mut vr, &mut wrk));
        assert_eq!(42, vr.options[slot].as_number());
        assert!(vr.action_stack.is_empty());
    }

    #[test]
    fn action_condition_selects_branch() {
        let (mut wrk, mut vr, slot) = fixture(1);
        let cond = Condition::new_string(CompOperator::Prefix, CondLValue::RequestPath, "/a")
            .expect("condition builds");
        let root = Action::new_condition(
            cond,
            Some(Action::new_setting(slot, OptionValue::Number(1))),
            Some(Action::new_setting(slot, OptionValue::Number(2))),
        );
        vr.enter_action(root);
        assert_eq!(HandlerResult::GoOn, execute(&mut vr, &mut wrk));
        assert_eq!(1, vr.options[slot].as_number());
    }

    struct YieldOnce {
        calls: AtomicUsize,
    }

    impl ActionHandler for YieldOnce {
        fn handle(
            &self,
            _vr: &mut VRequest,
            _wrk: &mut Worker,
            ctx: &mut ActionCtx,
        ) -> HandlerResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if ctx.is_none() {
                *ctx = Some(Box::new(1u32));
                HandlerResult::WaitForEvent
            } else {
                HandlerResult::GoOn
            }
        }
    }

    #[test]
    fn action_wait_for_event_resumes_same_frame() {
        let (mut wrk, mut vr, slot) = fixture(1);
        let handler = Arc::new(YieldOnce {
            calls: AtomicUsize::new(0),
        });
        let root = Action::new_list(vec![
            Action::new_function(handler.clone()),
            Action::new_setting(slot, OptionValue::Number(7)),
        ]);
        vr.enter_action(root);
        assert_eq!(HandlerResult::WaitForEvent, execute(&mut vr, &mut wrk));
        assert_eq!(0, vr.options[slot].as_number());
        // the wakeup re-enters; the yielded frame resumes, the list goes on
        assert_eq!(HandlerResult::GoOn, execute(&mut vr, &mut wrk));
        assert_eq!(2, handler.calls.load(Ordering::SeqCst));
        assert_eq!(7, vr.options[slot].as_number());
    }

    struct CleanupProbe {
        cleaned: Arc<AtomicUsize>,
    }

    impl ActionHandler for CleanupProbe {
        fn handle(
            &self,
            _vr: &mut VRequest,
            _wrk: &mut Worker,
            ctx: &mut ActionCtx,
        ) -> HandlerResult {
            *ctx = Some(Box::new(()));
            HandlerResult::WaitForEvent
        }

        fn cleanup(&self, _vr: &mut VRequest, _ctx: Box<dyn Any + Send>) {
            self.cleaned.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn action_unwind_invokes_frame_cleanups() {
        let (mut wrk, mut vr, _) = fixture(0);
        let cleaned = Arc::new(AtomicUsize::new(0));
        let root = Action::new_list(vec![Action::new_function(Arc::new(CleanupProbe {
            cleaned: cleaned.clone(),
        }))]);
        vr.enter_action(root);
        assert_eq!(HandlerResult::WaitForEvent, execute(&mut vr, &mut wrk));
        unwind(&mut vr);
        assert_eq!(1, cleaned.load(Ordering::SeqCst));
        assert!(vr.action_stack.is_empty());
    }

    #[test]
    fn action_execution_is_deterministic() {
        for _ in 0..2 {
            let (mut wrk, mut vr, slot) = fixture(1);
            let cond =
                Condition::new_string(CompOperator::Suffix, CondLValue::RequestPath, "/b").unwrap();
            let root = Action::new_list(vec![
                Action::new_setting(slot, OptionValue::Number(1)),
                Action::new_condition(
                    cond,
                    Some(Action::new_setting(slot, OptionValue::Number(2))),
                    None,
                ),
            ]);
            vr.enter_action(root);
            assert_eq!(HandlerResult::GoOn, execute(&mut vr, &mut wrk));
            assert_eq!(2, vr.options[slot].as_number());
        }
    }
}
