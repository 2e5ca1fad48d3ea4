use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One unit of work a virtual user repeats.
///
/// The engine times each call to [`Workload::execute`]. An `Err` (or a
/// panic) is an iteration error; an `Ok` output is then judged by
/// [`Workload::check`]. Either way the iteration yields exactly one outcome.
pub trait Workload: Send + Sync + 'static {
    type Output;

    /// Default tag for outcomes; a context may override it per iteration.
    fn name(&self) -> &str {
        "iteration"
    }

    fn execute(&self, ctx: &mut VuContext) -> anyhow::Result<Self::Output>;

    /// Success predicate over a completed call.
    fn check(&self, _output: &Self::Output) -> bool {
        true
    }

    /// Label reported when `check` fails.
    fn check_name(&self) -> &str {
        "check"
    }
}

/// Per-VU state handed to every iteration.
pub struct VuContext {
    vu: u32,
    iteration: u64,
    rng: StdRng,
    cancel: Arc<AtomicBool>,
    tag: Option<String>,
}

impl VuContext {
    pub fn new(vu: u32, seed: u64, cancel: Arc<AtomicBool>) -> Self {
        Self {
            vu,
            iteration: 0,
            rng: StdRng::seed_from_u64(seed.wrapping_add(vu as u64)),
            cancel,
            tag: None,
        }
    }

    pub fn vu(&self) -> u32 {
        self.vu
    }

    /// Zero-based count of iterations this VU has started.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// Seeded per VU, so a fixed run seed replays the same choices.
    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Set once the VU has been force-stopped. Long-running workloads should
    /// poll this and return early.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn set_tag(&mut self, tag: impl Into<String>) {
        self.tag = Some(tag.into());
    }

    pub(crate) fn take_tag(&mut self) -> Option<String> {
        self.tag.take()
    }

    pub(crate) fn advance(&mut self) {
        self.iteration += 1;
    }
}

/// Closure-backed workload; success means the closure returned `Ok`.
pub struct FnWorkload<F> {
    name: String,
    f: F,
}

pub fn from_fn<F>(name: impl Into<String>, f: F) -> FnWorkload<F>
where
    F: Fn(&mut VuContext) -> anyhow::Result<()> + Send + Sync + 'static,
{
    FnWorkload {
        name: name.into(),
        f,
    }
}

impl<F> Workload for FnWorkload<F>
where
    F: Fn(&mut VuContext) -> anyhow::Result<()> + Send + Sync + 'static,
{
    type Output = ();

    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, ctx: &mut VuContext) -> anyhow::Result<()> {
        (self.f)(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_context_rng_is_seeded_per_vu() {
        let draw = |vu, seed| {
            let mut ctx = VuContext::new(vu, seed, Arc::new(AtomicBool::new(false)));
            (0..8).map(|_| ctx.rng().gen_range(0..1000)).collect::<Vec<u32>>()
        };
        assert_eq!(draw(1, 42), draw(1, 42));
        assert_ne!(draw(1, 42), draw(2, 42));
    }

    #[test]
    fn test_context_cancellation_and_tag() {
        let flag = Arc::new(AtomicBool::new(false));
        let mut ctx = VuContext::new(3, 0, flag.clone());
        assert!(!ctx.is_cancelled());
        flag.store(true, Ordering::Relaxed);
        assert!(ctx.is_cancelled());

        ctx.set_tag("GET /tasks?page=2");
        assert_eq!(ctx.take_tag().as_deref(), Some("GET /tasks?page=2"));
        assert_eq!(ctx.take_tag(), None);

        ctx.advance();
        assert_eq!(ctx.iteration(), 1);
        assert_eq!(ctx.vu(), 3);
    }

    #[test]
    fn test_fn_workload() {
        let w = from_fn("ping", |ctx| {
            if ctx.vu() == 0 {
                Ok(())
            } else {
                anyhow::bail!("vu {} refused", ctx.vu())
            }
        });
        assert_eq!(w.name(), "ping");
        let mut ok = VuContext::new(0, 0, Arc::new(AtomicBool::new(false)));
        let mut bad = VuContext::new(1, 0, Arc::new(AtomicBool::new(false)));
        assert!(w.execute(&mut ok).is_ok());
        assert_eq!(w.execute(&mut bad).unwrap_err().to_string(), "vu 1 refused");
        assert!(w.check(&()));
    }
}
