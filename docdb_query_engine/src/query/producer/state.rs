/// The pagination state of a single [`super::DocumentProducer`] (`spec.md` §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerState {
    /// The buffer is empty and the producer has not yet started, or has a continuation it
    /// hasn't used yet. [`super::DocumentProducer::fill`] will issue a fetch.
    Idle,

    /// The buffer has at least one item available to [`super::DocumentProducer::peek`]/`pop`.
    HasData,

    /// The partition returned a `None` continuation; there is nothing more to fetch for this
    /// range, ever.
    Exhausted,

    /// The backend reported this range no longer exists. The owning base execution context must
    /// resolve the replacement ranges and create one producer per child.
    Split,

    /// A non-retryable error occurred and the producer cannot make further progress.
    Failed,
}
