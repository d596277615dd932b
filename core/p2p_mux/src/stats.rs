//! Engine counters in Prometheus text exposition format.

/// Counters updated by the engine on every pump
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Well-formed control messages dispatched (counter)
    pub control_received: u64,
    /// Control packets dropped as malformed (counter)
    pub control_malformed: u64,
    /// Application payloads handed to the handler (counter)
    pub data_delivered: u64,
    /// Application payloads dropped, sender not connected (counter)
    pub data_dropped: u64,
    /// Handler calls that returned an error or panicked (counter)
    pub handler_failures: u64,
    /// Substrate sessions accepted (counter)
    pub sessions_accepted: u64,
    /// Substrate sessions closed (counter)
    pub sessions_closed: u64,
    /// Connection attempts that failed (counter)
    pub connection_failures: u64,
}

impl TransportStats {
    /// Render counters in Prometheus text exposition format.
    pub fn render(&self) -> String {
        format!(
            "# HELP p2p_mux_control_received_total Control messages dispatched\n\
             # TYPE p2p_mux_control_received_total counter\n\
             p2p_mux_control_received_total {}\n\
             # HELP p2p_mux_control_malformed_total Malformed control packets dropped\n\
             # TYPE p2p_mux_control_malformed_total counter\n\
             p2p_mux_control_malformed_total {}\n\
             # HELP p2p_mux_data_delivered_total Application payloads delivered\n\
             # TYPE p2p_mux_data_delivered_total counter\n\
             p2p_mux_data_delivered_total {}\n\
             # HELP p2p_mux_data_dropped_total Application payloads from unconnected peers\n\
             # TYPE p2p_mux_data_dropped_total counter\n\
             p2p_mux_data_dropped_total {}\n\
             # HELP p2p_mux_handler_failures_total Handler calls that failed\n\
             # TYPE p2p_mux_handler_failures_total counter\n\
             p2p_mux_handler_failures_total {}\n\
             # HELP p2p_mux_sessions_accepted_total Substrate sessions accepted\n\
             # TYPE p2p_mux_sessions_accepted_total counter\n\
             p2p_mux_sessions_accepted_total {}\n\
             # HELP p2p_mux_sessions_closed_total Substrate sessions closed\n\
             # TYPE p2p_mux_sessions_closed_total counter\n\
             p2p_mux_sessions_closed_total {}\n\
             # HELP p2p_mux_connection_failures_total Failed connection attempts\n\
             # TYPE p2p_mux_connection_failures_total counter\n\
             p2p_mux_connection_failures_total {}\n",
            self.control_received,
            self.control_malformed,
            self.data_delivered,
            self.data_dropped,
            self.handler_failures,
            self.sessions_accepted,
            self.sessions_closed,
            self.connection_failures,
        )
    }
}
