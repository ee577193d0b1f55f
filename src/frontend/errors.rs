/// A typed, non-retryable failure that aborts compilation of the current
/// method.
///
/// None of these are fatal to the surrounding system: the documented
/// recovery is to keep executing the method unoptimized. Internal
/// inconsistencies (popping an empty simulator stack, malformed constant
/// pool indexes) are panics, not variants here — they indicate a frontend
/// bug rather than bad input.
#[derive(Debug, PartialEq, Eq)]
pub enum BuildError {
    /// Subroutine call/return usage the frontend cannot structure
    /// (nesting deeper than 4, conflicting scopes, unstructured flow)
    UnsupportedSubroutine(&'static str),

    /// A loop with more than one entry; the offending loop-membership
    /// mask is carried for diagnostics
    NonReducibleLoop(u64),

    /// More than 64 loops; the loop-membership bitmask is exhausted
    TooManyLoops,

    /// A loop whose header is an exception handler entry
    LoopThroughExceptionHandler,

    /// An exception handler entry that is also a normal branch target
    ExceptionEntryReachedNormally { handler_bci: i32 },

    /// Frame states disagree at a control-flow merge (stack height, slot
    /// kinds, or lock depth) — the instruction stream would not verify
    FrameStateMismatch(&'static str),

    /// An opcode the frontend does not implement
    UnsupportedOpcode { opcode: u8, bci: i32 },
}
