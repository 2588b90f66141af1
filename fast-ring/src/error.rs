/// Ring-side failures. Blocking entry points spin instead of returning
/// [`RingError::Overflow`]; the non-blocking variants surface it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RingError {
    /// Not enough free slab or blob space for the requested fragment.
    #[error("ring capacity exhausted")]
    Overflow,
    /// The shared shutdown flag was raised.
    #[error("cooperative shutdown requested")]
    Shutdown,
}
