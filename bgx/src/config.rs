/// Commands sent once the modem reports application ready.
pub const DEFAULT_START_COMMANDS: &[&str] = &["ATE0", "ATV1", "AT+IFC=2,2"];

/// Driver configuration. Pin timings differ between BG96, BG95 and BG77
/// carriers, so all of them are adjustable per board.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub struct Config {
    pub(crate) cmd_timeout: u32,
    pub(crate) prompt_timeout: u32,
    pub(crate) power_on_hold: u32,
    pub(crate) power_off_hold: u32,
    pub(crate) status_poll: u32,
    pub(crate) status_timeout: u32,
    pub(crate) reset_hold: u32,
    pub(crate) sw_reset_timeout: u32,
    pub(crate) power_cycle_gap: u32,
    pub(crate) app_ready_timeout: u32,
    pub(crate) start_cmd_timeout: u32,
    pub(crate) start_cmd_attempts: u8,
    pub(crate) start_commands: &'static [&'static str],
    pub(crate) bridge_clock_hz: u32,
    pub(crate) baud: u32,
    pub(crate) rx_trigger: u8,
    pub(crate) tx_trigger: u8,
    pub(crate) ird_timeout: u32,
    pub(crate) rx_idle_pull: u32,
    pub(crate) mqtt_publish_timeout: u32,
    pub(crate) http_timeout_secs: u16,
    pub(crate) data_context: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cmd_timeout: 800,
            prompt_timeout: 5000,
            power_on_hold: 500,
            power_off_hold: 1500,
            status_poll: 100,
            status_timeout: 6000,
            reset_hold: 4000,
            sw_reset_timeout: 3000,
            power_cycle_gap: 500,
            app_ready_timeout: 5000,
            start_cmd_timeout: 2000,
            start_cmd_attempts: 2,
            start_commands: DEFAULT_START_COMMANDS,
            bridge_clock_hz: 7_378_000,
            baud: 115_200,
            rx_trigger: 56,
            tx_trigger: 56,
            ird_timeout: 10_000,
            rx_idle_pull: 50,
            mqtt_publish_timeout: 7500,
            http_timeout_secs: 60,
            data_context: 1,
        }
    }
}

impl Config {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Default response timeout for commands that do not override it.
    #[must_use]
    pub const fn cmd_timeout(mut self, ms: u32) -> Self {
        self.cmd_timeout = ms;
        self
    }

    #[must_use]
    pub const fn prompt_timeout(mut self, ms: u32) -> Self {
        self.prompt_timeout = ms;
        self
    }

    /// Power key hold times for switching the module on and off.
    #[must_use]
    pub const fn power_key_hold(mut self, on_ms: u32, off_ms: u32) -> Self {
        self.power_on_hold = on_ms;
        self.power_off_hold = off_ms;
        self
    }

    #[must_use]
    pub const fn status_timeout(mut self, ms: u32) -> Self {
        self.status_timeout = ms;
        self
    }

    #[must_use]
    pub const fn reset_hold(mut self, ms: u32) -> Self {
        self.reset_hold = ms;
        self
    }

    #[must_use]
    pub const fn app_ready_timeout(mut self, ms: u32) -> Self {
        self.app_ready_timeout = ms;
        self
    }

    #[must_use]
    pub const fn start_commands(mut self, cmds: &'static [&'static str]) -> Self {
        self.start_commands = cmds;
        self
    }

    /// FIFO trigger levels, rounded down to the bridge's granularity of 4.
    #[must_use]
    pub const fn fifo_triggers(mut self, rx: u8, tx: u8) -> Self {
        self.rx_trigger = rx;
        self.tx_trigger = tx;
        self
    }

    #[must_use]
    pub const fn baud(mut self, clock_hz: u32, baud: u32) -> Self {
        self.bridge_clock_hz = clock_hz;
        self.baud = baud;
        self
    }

    /// How long an armed stream must stay quiet before a partly filled page
    /// is handed to the consumer.
    #[must_use]
    pub const fn rx_idle_pull(mut self, ms: u32) -> Self {
        self.rx_idle_pull = ms;
        self
    }

    #[must_use]
    pub const fn ird_timeout(mut self, ms: u32) -> Self {
        self.ird_timeout = ms;
        self
    }

    #[must_use]
    pub const fn mqtt_publish_timeout(mut self, ms: u32) -> Self {
        self.mqtt_publish_timeout = ms;
        self
    }

    #[must_use]
    pub const fn http_timeout(mut self, secs: u16) -> Self {
        self.http_timeout_secs = secs;
        self
    }

    /// PDP context carrying socket, MQTT and HTTP traffic.
    #[must_use]
    pub const fn data_context(mut self, id: u8) -> Self {
        self.data_context = id;
        self
    }

    pub(crate) const fn divisor(&self) -> u16 {
        let div = self.bridge_clock_hz / (16 * self.baud);
        if div == 0 {
            1
        } else {
            div as u16
        }
    }
}
