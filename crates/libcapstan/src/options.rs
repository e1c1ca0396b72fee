//! Client behavior options.
//!
//! A fixed, small set of independent flags, so they are named struct fields
//! rather than a bitmask. The `allocated` field is pinned: it records that
//! the client owns its own storage and survives every `remove`/`set`, which
//! mirrors the teardown contract callers rely on.

/// One nameable option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opt {
    /// Status polling returns `Retry` instead of waiting for the answer.
    NonBlocking,
    /// Reserved: deliver result chunks without client-side buffering.
    UnbufferedResult,
    /// Lock the client against creating new tasks.
    NoNew,
    /// `run_tasks` drains finished tasks instead of retaining them.
    FreeTasks,
    /// Pinned. Present so option sets can be carried around wholesale; any
    /// attempt to clear it is silently ignored.
    Allocated,
}

/// The client's current option set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    pub non_blocking: bool,
    pub unbuffered_result: bool,
    pub no_new: bool,
    pub free_tasks: bool,
    allocated: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            non_blocking: false,
            unbuffered_result: false,
            no_new: false,
            free_tasks: false,
            allocated: true,
        }
    }
}

impl ClientOptions {
    pub fn allocated(&self) -> bool {
        self.allocated
    }

    pub fn contains(&self, opt: Opt) -> bool {
        match opt {
            Opt::NonBlocking => self.non_blocking,
            Opt::UnbufferedResult => self.unbuffered_result,
            Opt::NoNew => self.no_new,
            Opt::FreeTasks => self.free_tasks,
            Opt::Allocated => self.allocated,
        }
    }

    /// Turn one option on.
    pub fn add(&mut self, opt: Opt) {
        self.apply(opt, true);
    }

    /// Turn one option off. `Allocated` is pinned and ignored here.
    pub fn remove(&mut self, opt: Opt) {
        if opt == Opt::Allocated {
            return;
        }
        self.apply(opt, false);
    }

    /// Replace the whole set. `allocated` keeps its pinned value regardless
    /// of what `other` carries.
    pub fn set(&mut self, other: ClientOptions) {
        let allocated = self.allocated;
        *self = other;
        self.allocated = allocated;
    }

    /// Builder-style `add`, for assembling a set to pass to [`set`].
    ///
    /// [`set`]: ClientOptions::set
    pub fn with(mut self, opt: Opt) -> Self {
        self.add(opt);
        self
    }

    fn apply(&mut self, opt: Opt, value: bool) {
        match opt {
            Opt::NonBlocking => self.non_blocking = value,
            Opt::UnbufferedResult => self.unbuffered_result = value,
            Opt::NoNew => self.no_new = value,
            Opt::FreeTasks => self.free_tasks = value,
            Opt::Allocated => self.allocated = value,
        }
    }
}
