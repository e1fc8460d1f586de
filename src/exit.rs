/// The reason a privileged worker transfers out to the unprivileged host
/// context.
///
/// The host services the request and hands the result back through
/// [`ContinuationBuffer::resume_transferred`](crate::ContinuationBuffer::resume_transferred),
/// at which point [`TransferCtx::transfer_out`](crate::TransferCtx::transfer_out)
/// returns it to the worker.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxHostCall {
    /// A generic host service call.
    Service {
        /// The service number.
        nr: u64,
        /// The argument of the service.
        arg: u64,
    },
    /// Acquire a lock that is contended in the privileged context.
    LockAcquire {
        /// Address of the lock.
        lock: usize,
    },
    /// Grow a page pool that ran dry.
    PoolAllocate {
        /// Number of pages requested.
        pages: usize,
    },
    /// Flush the privileged log buffer to the host.
    FlushLog,
    /// The worker yields so the host may preempt the vCPU thread.
    Preempt,
    /// Report an error the worker cannot handle itself.
    ReportError {
        /// Host-defined error code.
        code: i32,
    },
}
