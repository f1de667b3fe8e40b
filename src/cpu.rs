// CpuContext is the object a host embeds: one translator, one address table and one code
// cache shared by every ExecutionContext it creates. It subscribes to the memory provider so
// that writes to tracked code pages and unmaps invalidate the overlapping translations, and it
// runs the dispatch loop on behalf of the caller. The subscription holds a weak reference so
// the memory provider can outlive the CPU.

//! CPU front door: context factory and the dispatch loop.

use crate::core::config::JitConfig;
use crate::core::error::JitResult;
use crate::decoder::ExecutionMode;
use crate::jit::translator::{Translator, TranslatorStats};
use crate::state::callbacks::{CounterSource, ExceptionCallbacks};
use crate::state::context::ExecutionContext;
use crate::state::memory::{MemoryEvent, MemoryEventHandler, MemoryManager};
use crate::state::native_interface;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

struct CodeInvalidator {
    translator: Weak<Translator>,
}

impl MemoryEventHandler for CodeInvalidator {
    fn on_memory_event(&self, event: MemoryEvent) {
        let Some(translator) = self.translator.upgrade() else {
            return;
        };
        match event {
            MemoryEvent::CodeWritten { address, size } | MemoryEvent::Unmapped { address, size } => {
                translator.invalidate_region(address, size);
            }
        }
    }
}

/// A guest CPU: translator, code cache and the execution entry point.
pub struct CpuContext {
    translator: Arc<Translator>,
    rejit_worker: Option<JoinHandle<()>>,
}

impl CpuContext {
    pub fn new(memory: Arc<dyn MemoryManager>, config: JitConfig) -> JitResult<Self> {
        let background = config.tiered && config.background_rejit;
        let translator = Arc::new(Translator::new(config, memory.clone())?);
        memory.subscribe(Arc::new(CodeInvalidator {
            translator: Arc::downgrade(&translator),
        }));

        let rejit_worker = if background {
            let worker = translator.clone();
            match std::thread::Builder::new()
                .name("armjit-rejit".into())
                .spawn(move || worker.run_rejit_worker())
            {
                Ok(handle) => Some(handle),
                Err(error) => {
                    log::warn!("Could not start the re-translation worker, draining inline: {error}");
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            translator,
            rejit_worker,
        })
    }

    pub fn mode(&self) -> ExecutionMode {
        self.translator.config().mode
    }

    /// A fresh guest thread for this CPU.
    pub fn create_context(
        &self,
        counter: Arc<dyn CounterSource>,
        callbacks: Arc<dyn ExceptionCallbacks>,
    ) -> ExecutionContext {
        let interval = self.translator.config().sync_interval.max(1) as u32;
        ExecutionContext::new(self.mode(), counter, callbacks, interval)
    }

    /// Run guest code from `address` until the context stops.
    ///
    /// Returns the first memory fault or translation failure. The context's pc is left at the
    /// instruction that was about to run.
    pub fn execute(&self, context: &mut ExecutionContext, address: u64) -> JitResult<()> {
        let translator = self.translator.as_ref();
        let _dispatch = translator.enter_dispatch();
        let mut guard = native_interface::register(context, translator);
        let entry = translator.entry();

        {
            let ctx = guard.context();
            ctx.begin_run();
            ctx.set_pc(address);
            ctx.timer_mut().start();
        }
        log::debug!("Executing from {address:#x}");

        let result = loop {
            let pc = guard.context().pc();
            let host = match translator.resolve_host(pc) {
                Ok(host) => host,
                Err(error) => break Err(error),
            };
            let next = unsafe { entry(guard.context().native_ptr(), host) };
            guard.context().set_pc(next);

            if let Some(error) = guard.take_error() {
                break Err(error);
            }
            if !guard.context().is_running() {
                break Ok(());
            }
            if self.rejit_worker.is_none() {
                translator.drain_rejit_queue();
            }
        };

        let ctx = guard.context();
        ctx.timer_mut().stop();
        ctx.mark_stopped();
        match &result {
            Ok(()) => log::debug!("Stopped at {:#x}", ctx.pc()),
            Err(error) => log::error!("Execution stopped at {:#x}: {error}", ctx.pc()),
        }
        result
    }

    /// Drop translations of `[address, address + size)`. Returns how many were removed.
    pub fn invalidate_cache_region(&self, address: u64, size: u64) -> usize {
        self.translator.invalidate_region(address, size)
    }

    /// Allocate address table levels for a code range ahead of execution.
    pub fn prepare_code_range(&self, address: u64, size: u64) {
        self.translator.table().prepare(address, size);
    }

    pub fn clear_cache(&self) -> usize {
        self.translator.clear_cache()
    }

    pub fn stats(&self) -> TranslatorStats {
        self.translator.stats()
    }

    pub fn translator(&self) -> &Arc<Translator> {
        &self.translator
    }
}

impl Drop for CpuContext {
    fn drop(&mut self) {
        self.translator.shutdown_rejit_worker();
        if let Some(worker) = self.rejit_worker.take() {
            if worker.join().is_err() {
                log::error!("Re-translation worker panicked");
            }
        }
    }
}
