//! Tunables of a stack.
//!
//! All values are fixed when the [`Stack`] is created, there is no reload. The defaults are the
//! constants in [`consts`].
//!
//! [`Stack`]: ../socket/struct.Stack.html
//! [`consts`]: consts/index.html
use crate::time::Duration;
use crate::wire::ip::Address;

/// Compile-time defaults.
pub mod consts {
    /// Number of concurrently open streams.
    pub const MAX_CONCURRENCY: usize = 1024;
    /// Number of send and of receive buffers.
    pub const MAX_BUFFERS: usize = 1024;
    pub const SEND_BUFFER_SIZE: usize = 8192;
    pub const RECV_BUFFER_SIZE: usize = 8192;
    pub const BACKLOG: usize = 1024;

    /// Maximum segment size we announce.
    pub const MSS: u16 = 1460;
    /// Length of the timestamp option including its two padding bytes.
    pub const TS_OPTION_LEN: u16 = 12;
    /// Window scale shift we announce.
    pub const WINDOW_SCALE: u8 = 7;
    pub const INITIAL_WINDOW: u32 = 14600;
    pub const MAX_WINDOW: u32 = 65535;

    pub const TIMEWAIT_MS: u64 = 0;
    pub const IDLE_TIMEOUT_MS: u64 = 30_000;
    pub const INITIAL_RTO_MS: u32 = 500;
    /// Lower bound on the computed retransmission timeout.
    pub const MIN_RTO_MS: u32 = 200;

    pub const MAX_RTX: u8 = 16;
    pub const MAX_SYN_RETRY: u8 = 7;
    pub const MAX_BACKOFF: u8 = 7;

    /// Timestamp ticks per second.
    pub const HZ: u32 = 1000;
    /// Slots of the retransmission wheel, in ticks.
    pub const RTO_HASH: usize = 3000;
    pub const FLOW_BINS: usize = 131_072;
    pub const LISTENER_BINS: usize = 1024;
    pub const EVENT_QUEUE: usize = 1024;
    /// Streams served from one output list per tick.
    pub const OUTPUT_BUDGET: usize = MAX_CONCURRENCY;

    /// Delay after the last received ack before a blocked window is probed.
    pub const WINDOW_PROBE_MS: u32 = 500;
}

/// The configuration of a stack and its network endpoint.
#[derive(Clone, Debug)]
pub struct Config {
    /// Upper bound on open streams, also the socket table size.
    pub max_concurrency: usize,
    /// Number of buffers in each of the send and receive pools.
    pub max_buffers: usize,
    pub send_buffer: usize,
    pub recv_buffer: usize,
    /// Default accept backlog, and the upper bound on any requested backlog.
    pub backlog: usize,
    pub mss: u16,
    pub window_scale: u8,
    pub initial_window: u32,
    pub max_window: u32,
    /// How long a stream lingers in `TIME_WAIT`.
    pub timewait: Duration,
    /// Inactivity after which an established stream is dropped.
    pub idle_timeout: Duration,
    pub initial_rto: u32,
    pub max_rtx: u8,
    pub max_syn_retry: u8,
    pub max_backoff: u8,
    pub hz: u32,
    pub rto_hash: usize,
    /// Buckets of the flow table, must be a power of two.
    pub flow_bins: usize,
    /// Buckets of the listener table, must be a power of two.
    pub listener_bins: usize,
    /// Capacity of each readiness event queue.
    pub event_queue: usize,
    /// Upper bound on streams each output list serves in one tick, the rest waits for the next.
    pub output_budget: usize,
    /// Back the buffer pools with huge pages if the platform allows it.
    pub huge_pages: bool,
    /// Our own address, used as the source of actively opened streams.
    pub local_addr: Address,
}

impl Config {
    /// The effective segment payload, leaving room for the timestamp option.
    pub fn eff_mss(&self) -> u16 {
        self.mss - consts::TS_OPTION_LEN
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_concurrency: consts::MAX_CONCURRENCY,
            max_buffers: consts::MAX_BUFFERS,
            send_buffer: consts::SEND_BUFFER_SIZE,
            recv_buffer: consts::RECV_BUFFER_SIZE,
            backlog: consts::BACKLOG,
            mss: consts::MSS,
            window_scale: consts::WINDOW_SCALE,
            initial_window: consts::INITIAL_WINDOW,
            max_window: consts::MAX_WINDOW,
            timewait: Duration::from_millis(consts::TIMEWAIT_MS),
            idle_timeout: Duration::from_millis(consts::IDLE_TIMEOUT_MS),
            initial_rto: consts::INITIAL_RTO_MS,
            max_rtx: consts::MAX_RTX,
            max_syn_retry: consts::MAX_SYN_RETRY,
            max_backoff: consts::MAX_BACKOFF,
            hz: consts::HZ,
            rto_hash: consts::RTO_HASH,
            flow_bins: consts::FLOW_BINS,
            listener_bins: consts::LISTENER_BINS,
            event_queue: consts::EVENT_QUEUE,
            output_budget: consts::OUTPUT_BUDGET,
            huge_pages: false,
            local_addr: Address::UNSPECIFIED,
        }
    }
}
