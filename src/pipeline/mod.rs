//! The stanza pipeline (spec §4.6).
//!
//! A generalization of the teacher's sequential read/write phases in
//! `xmpp/client.rs` (stream-open → STARTTLS → SASL → bind, each phase
//! reading and reacting to the next chunk off the wire) into a chain of
//! named, addressable stages. Each [`Pipe`] sees every inbound element
//! before the next one does, and every outbound element after the next
//! one has — the same ordering `other_examples/…arachnist-xmpp-rs` gets
//! from composing `Sink`/`Stream` adapters, but addressable by name so
//! the handshake pipe can later be swapped out for a no-op once
//! negotiation completes.
//!
//! The pipeline itself never touches raw bytes; that is the transport
//! shim's job. It only ever moves [`crate::xml::Element`] trees.

use std::fmt;

use crate::error::{Error, Result};
use crate::xml::Element;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Stopped,
    Running,
    Disposed,
}

/// Handle passed to every [`Pipe`] hook. Lets a pipe inject an element
/// directly onto the outbound path (e.g. an auto-reply) without waiting
/// for its own `on_write` to be invoked from outside.
pub struct PipelineContext<'a> {
    pub(crate) injected_outbound: &'a mut Vec<Element>,
    pub(crate) injected_inbound: &'a mut Vec<Element>,
}

impl<'a> PipelineContext<'a> {
    /// Queues an element to be sent out, skipping straight past this
    /// pipe's own position (it re-enters the write chain from the top).
    pub fn send(&mut self, element: Element) {
        self.injected_outbound.push(element);
    }

    /// Queues an element as though it had just arrived from the
    /// transport, re-entering the read chain from the top.
    pub fn deliver(&mut self, element: Element) {
        self.injected_inbound.push(element);
    }
}

/// One stage of the pipeline. All hooks default to pass-through so a
/// pipe only needs to implement the directions it cares about.
///
/// `Pipe: Any` so a caller that knows the concrete type registered
/// under a given name (e.g. [`crate::session::Session`] knowing it
/// installed a `HandshakerPipe`) can downcast via [`Pipe::as_any_mut`]
/// to reach methods outside the hook contract, such as an
/// out-of-band `close_stream()` request.
pub trait Pipe: Send + std::any::Any {
    fn name(&self) -> &str;

    fn on_read(&mut self, _ctx: &mut PipelineContext, element: Element) -> Result<Option<Element>> {
        Ok(Some(element))
    }

    fn on_write(&mut self, _ctx: &mut PipelineContext, element: Element) -> Result<Option<Element>> {
        Ok(Some(element))
    }

    fn on_added(&mut self, _ctx: &mut PipelineContext) {}

    fn on_removed(&mut self, _ctx: &mut PipelineContext) {}

    fn as_any(&self) -> &dyn std::any::Any;

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;
}

struct PipeEntry {
    name: String,
    pipe: Box<dyn Pipe>,
}

impl fmt::Debug for PipeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeEntry").field("name", &self.name).finish()
    }
}

/// Ordered chain of [`Pipe`]s. Index 0 is the "outbound end" (nearest
/// the transport: first to see inbound data, last to see outbound
/// data); the last entry is the "inbound end" (nearest the
/// application: last to see inbound data, first to see outbound data).
pub struct Pipeline {
    state: PipelineState,
    pipes: Vec<PipeEntry>,
    inbound_exceptions: Vec<Error>,
    outbound_exceptions: Vec<Error>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            state: PipelineState::Stopped,
            pipes: Vec::new(),
            inbound_exceptions: Vec::new(),
            outbound_exceptions: Vec::new(),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Adds `pipe` at the inbound end (furthest from the transport,
    /// closest to the application) — the position a stanza-dispatch
    /// plugin manager occupies, since it should see stream-negotiation
    /// noise already filtered out by the pipes ahead of it. Returns
    /// whatever `on_added` sent straight to the outbound path.
    pub fn add_at_inbound_end(&mut self, name: impl Into<String>, pipe: Box<dyn Pipe>) -> Vec<Element> {
        self.insert_and_notify(self.pipes.len(), name.into(), pipe)
    }

    /// Adds `pipe` at the outbound end (closest to the transport) — the
    /// position the handshake pipe occupies, since it must see and
    /// react to every byte before anything else does. Returns whatever
    /// `on_added` sent straight to the outbound path (e.g. the initial
    /// stream `<open>`), since there is nothing ahead of this pipe left
    /// to traverse it.
    pub fn add_at_outbound_end(&mut self, name: impl Into<String>, pipe: Box<dyn Pipe>) -> Vec<Element> {
        self.insert_and_notify(0, name.into(), pipe)
    }

    fn insert_and_notify(&mut self, index: usize, name: String, mut pipe: Box<dyn Pipe>) -> Vec<Element> {
        let mut scratch_out = Vec::new();
        let mut scratch_in = Vec::new();
        let mut ctx = PipelineContext {
            injected_outbound: &mut scratch_out,
            injected_inbound: &mut scratch_in,
        };
        pipe.on_added(&mut ctx);
        self.pipes.insert(index, PipeEntry { name, pipe });
        scratch_out
    }

    /// Replaces the pipe named `name` in place, calling `on_removed` on
    /// the old one and `on_added` on the new one. No-op if not found.
    pub fn replace(&mut self, name: &str, mut pipe: Box<dyn Pipe>) {
        if let Some(entry) = self.pipes.iter_mut().find(|e| e.name == name) {
            let mut scratch_out = Vec::new();
            let mut scratch_in = Vec::new();
            let mut ctx = PipelineContext {
                injected_outbound: &mut scratch_out,
                injected_inbound: &mut scratch_in,
            };
            entry.pipe.on_removed(&mut ctx);
            pipe.on_added(&mut ctx);
            entry.pipe = pipe;
        }
    }

    /// Removes the pipe named `name`, calling `on_removed` on it.
    pub fn remove(&mut self, name: &str) {
        if let Some(pos) = self.pipes.iter().position(|e| e.name == name) {
            let mut entry = self.pipes.remove(pos);
            let mut scratch_out = Vec::new();
            let mut scratch_in = Vec::new();
            let mut ctx = PipelineContext {
                injected_outbound: &mut scratch_out,
                injected_inbound: &mut scratch_in,
            };
            entry.pipe.on_removed(&mut ctx);
        }
    }

    pub fn get(&self, name: &str) -> Option<&dyn Pipe> {
        self.pipes.iter().find(|e| e.name == name).map(|e| e.pipe.as_ref())
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut (dyn Pipe + 'static)> {
        self.pipes.iter_mut().find(|e| e.name == name).map(|e| e.pipe.as_mut())
    }

    pub fn start(&mut self) {
        self.state = PipelineState::Running;
    }

    pub fn stop_now(&mut self) {
        self.state = PipelineState::Stopped;
    }

    /// Tears the pipeline down, calling `on_removed` on every pipe from
    /// the inbound end back to the outbound end (reverse of how they
    /// were added, mirroring drop order).
    pub fn dispose(&mut self) {
        while let Some(mut entry) = self.pipes.pop() {
            let mut scratch_out = Vec::new();
            let mut scratch_in = Vec::new();
            let mut ctx = PipelineContext {
                injected_outbound: &mut scratch_out,
                injected_inbound: &mut scratch_in,
            };
            entry.pipe.on_removed(&mut ctx);
        }
        self.state = PipelineState::Disposed;
    }

    /// Feeds `element` in from the transport, running it through every
    /// pipe from the outbound end to the inbound end. Returns the
    /// element that reached the application end, or `None` if some pipe
    /// swallowed it (or raised an error, which is recorded separately).
    pub fn read(&mut self, element: Element) -> Option<Element> {
        let mut queue = vec![element];
        let mut delivered = None;

        while let Some(current) = queue.pop() {
            let mut value = Some(current);
            for entry in self.pipes.iter_mut() {
                let Some(el) = value.take() else { break };
                let mut injected_out = Vec::new();
                let mut injected_in = Vec::new();
                let mut ctx = PipelineContext {
                    injected_outbound: &mut injected_out,
                    injected_inbound: &mut injected_in,
                };
                match entry.pipe.on_read(&mut ctx, el) {
                    Ok(next) => value = next,
                    Err(e) => {
                        self.inbound_exceptions.push(e);
                        value = None;
                    }
                }
                for out in injected_out {
                    self.write_internal(out);
                }
                queue.extend(injected_in);
            }
            if let Some(el) = value {
                delivered = Some(el);
            }
        }
        delivered
    }

    /// Feeds `element` out from the application, running it through
    /// every pipe from the inbound end to the outbound end. Returns the
    /// element ready to hand to the transport, or `None` if swallowed.
    pub fn write(&mut self, element: Element) -> Option<Element> {
        self.write_internal(element)
    }

    fn write_internal(&mut self, element: Element) -> Option<Element> {
        let mut value = Some(element);
        for entry in self.pipes.iter_mut().rev() {
            let Some(el) = value.take() else { break };
            let mut injected_out = Vec::new();
            let mut injected_in = Vec::new();
            let mut ctx = PipelineContext {
                injected_outbound: &mut injected_out,
                injected_inbound: &mut injected_in,
            };
            match entry.pipe.on_write(&mut ctx, el) {
                Ok(next) => value = next,
                Err(e) => {
                    self.outbound_exceptions.push(e);
                    value = None;
                }
            }
            for out in injected_out {
                value = value.or(Some(out));
            }
            let _ = injected_in;
        }
        value
    }

    pub fn drain_inbound_exceptions(&mut self) -> Vec<Error> {
        std::mem::take(&mut self.inbound_exceptions)
    }

    pub fn drain_outbound_exceptions(&mut self) -> Vec<Error> {
        std::mem::take(&mut self.outbound_exceptions)
    }

    pub fn names(&self) -> Vec<&str> {
        self.pipes.iter().map(|e| e.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Uppercase;

    impl Pipe for Uppercase {
        fn name(&self) -> &str {
            "uppercase"
        }

        fn on_read(&mut self, _ctx: &mut PipelineContext, element: Element) -> Result<Option<Element>> {
            let mut el = element;
            el.name = el.name.to_uppercase();
            Ok(Some(el))
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
            self
        }
    }

    struct Swallower;

    impl Pipe for Swallower {
        fn name(&self) -> &str {
            "swallower"
        }

        fn on_read(&mut self, _ctx: &mut PipelineContext, _element: Element) -> Result<Option<Element>> {
            Ok(None)
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
            self
        }
    }

    struct Failing;

    impl Pipe for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn on_read(&mut self, _ctx: &mut PipelineContext, _element: Element) -> Result<Option<Element>> {
            Err(Error::InvalidState("boom"))
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
            self
        }
    }

    #[test]
    fn read_runs_pipes_in_outbound_to_inbound_order() {
        let mut pipeline = Pipeline::new();
        pipeline.add_at_inbound_end("upper", Box::new(Uppercase));
        let result = pipeline.read(Element::new("iq", None)).unwrap();
        assert_eq!(result.name, "IQ");
    }

    #[test]
    fn swallowed_element_never_reaches_the_end() {
        let mut pipeline = Pipeline::new();
        pipeline.add_at_outbound_end("swallow", Box::new(Swallower));
        pipeline.add_at_inbound_end("upper", Box::new(Uppercase));
        assert!(pipeline.read(Element::new("iq", None)).is_none());
    }

    #[test]
    fn errors_are_recorded_separately_from_the_result() {
        let mut pipeline = Pipeline::new();
        pipeline.add_at_inbound_end("failing", Box::new(Failing));
        let result = pipeline.read(Element::new("iq", None));
        assert!(result.is_none());
        let errs = pipeline.drain_inbound_exceptions();
        assert_eq!(errs.len(), 1);
    }

    #[test]
    fn get_and_remove_by_name() {
        let mut pipeline = Pipeline::new();
        pipeline.add_at_inbound_end("upper", Box::new(Uppercase));
        assert!(pipeline.get("upper").is_some());
        pipeline.remove("upper");
        assert!(pipeline.get("upper").is_none());
    }

    #[test]
    fn dispose_clears_every_pipe() {
        let mut pipeline = Pipeline::new();
        pipeline.add_at_inbound_end("upper", Box::new(Uppercase));
        pipeline.start();
        pipeline.dispose();
        assert_eq!(pipeline.state(), PipelineState::Disposed);
        assert!(pipeline.names().is_empty());
    }
}
