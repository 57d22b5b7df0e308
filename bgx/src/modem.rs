use crate::atcmd::AtCmd;
use crate::bridge::Bridge;
use crate::iop::STREAM_SLOTS;
use crate::platform::{BridgeBus, PinConfig, PinMode, Platform};
use crate::services::info::ModemInfo;
use crate::services::network::NetworkInfo;
use crate::streams::socket::Ird;
use crate::streams::StreamCtrl;
use crate::urc::UrcEvent;
use crate::{Config, Iop};

/// Lifecycle of the module as seen by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceState {
    PowerOff,
    PoweringOn,
    PowerOn,
    /// `APP RDY` received, AT commands accepted
    AppReady,
    Fault,
}

/// Fault-class events not tied to a caller initiated command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AppEvent {
    /// Module did not power up
    HwInitFailed,
    /// Bridge scratch-pad read back mismatch or failing transfers
    SpiFault,
    /// Module powered but not answering the start commands
    HardLogicFault,
    /// Module restarted while in operation
    ResetDetected,
    BufferOverflow,
    /// Bulk read header never arrived
    ProtocolFault,
    SocketClosed,
    PdpDeactivated,
    MqttClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ResetKind {
    /// `AT+CFUN=1,1`, falling back to a power cycle
    Software,
    /// Reset pin pulse
    Hardware,
    PowerCycle,
}

/// Application notification callback: event and a short detail text.
pub type Notifier<'a> = &'a dyn Fn(AppEvent, &str);

/// A Quectel BGx modem behind an SC16IS741 bridge.
pub struct Modem<'a, B, P> {
    pub(crate) iop: &'a Iop<'a, B>,
    pub(crate) platform: P,
    pub(crate) pins: PinConfig,
    pub(crate) config: Config,
    pub(crate) state: DeviceState,
    pub(crate) at: AtCmd,
    pub(crate) streams: [Option<StreamCtrl<'a>>; STREAM_SLOTS],
    pub(crate) ird: Ird,
    pub(crate) ird_cursor: u8,
    pub(crate) network: NetworkInfo,
    pub(crate) info: ModemInfo,
    pub(crate) app_ready_seen: bool,
    pub(crate) irq_attached: bool,
    notify: Option<Notifier<'a>>,
}

impl<'a, B, P> Modem<'a, B, P>
where
    B: BridgeBus,
    P: Platform,
{
    /// Claim the pins and hand the bridge bus to `iop`. No bytes are
    /// exchanged until [`Modem::start`].
    pub fn new(
        iop: &'a Iop<'a, B>,
        bus: B,
        mut platform: P,
        pins: PinConfig,
        config: Config,
    ) -> Self {
        platform.open_pin(pins.status, PinMode::Input);
        platform.open_pin(pins.irq, PinMode::InputPullUp);
        platform.open_pin(pins.power_key, PinMode::Output);
        platform.write_pin(pins.power_key, false);
        platform.open_pin(pins.reset, PinMode::Output);
        platform.write_pin(pins.reset, false);
        iop.install(Bridge::new(bus));

        Self {
            iop,
            platform,
            pins,
            config,
            state: DeviceState::PowerOff,
            at: AtCmd::new(),
            streams: [None, None, None, None, None, None, None, None],
            ird: Ird::Idle,
            ird_cursor: 0,
            network: NetworkInfo::default(),
            info: ModemInfo::default(),
            app_ready_seen: false,
            irq_attached: false,
            notify: None,
        }
    }

    #[must_use]
    pub fn with_notifier(mut self, notify: Notifier<'a>) -> Self {
        self.notify = Some(notify);
        self
    }

    /// Detach from the hardware, returning the bus and the platform.
    pub fn destroy(mut self) -> Option<(B, P)> {
        if self.irq_attached {
            self.platform.detach_irq(self.pins.irq);
        }
        let _ = self.iop.with_bridge(|b| b.disable_irq());
        for pin in [self.pins.status, self.pins.irq, self.pins.power_key, self.pins.reset] {
            self.platform.close_pin(pin);
        }
        let bridge = self.iop.uninstall()?;
        Some((bridge.release(), self.platform))
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn platform(&mut self) -> &mut P {
        &mut self.platform
    }

    /// Raise the cancellation flag for the wait in progress.
    pub fn cancel(&self) {
        self.iop.cancel();
    }

    pub(crate) fn now(&self) -> u32 {
        self.platform.millis()
    }

    pub(crate) fn notify(&self, event: AppEvent, detail: &str) {
        warn!("app event {:?}: {}", event, detail);
        if let Some(notify) = self.notify {
            notify(event, detail);
        }
    }

    /// Cooperative pump: handles queued URC events and moves received stream
    /// data to the registered receivers. Call it often.
    pub fn do_work(&mut self) {
        while let Some(event) = self.iop.with_rx(|rx| rx.pop_event()) {
            self.handle_event(event);
        }
        let faults = self.iop.take_bus_faults();
        if faults > 0 {
            self.notify(AppEvent::SpiFault, "bridge transfer failed in interrupt");
        }
        if self.state == DeviceState::AppReady {
            self.dispatch_streams();
        }
    }

    fn handle_event(&mut self, event: UrcEvent) {
        debug!("event {:?}", event);
        match event {
            UrcEvent::AppReady => {
                self.app_ready_seen = true;
                if self.state == DeviceState::AppReady {
                    self.notify(AppEvent::ResetDetected, "APP RDY while running");
                }
            }
            UrcEvent::SocketClosed(ctx) => {
                self.on_socket_closed(ctx);
                self.notify(AppEvent::SocketClosed, "remote closed");
            }
            UrcEvent::PdpDeactivated(ctx) => {
                self.network.deactivated(ctx);
                self.notify(AppEvent::PdpDeactivated, "pdp context deactivated");
            }
            UrcEvent::MqttClosed { ctx, .. } | UrcEvent::MqttDisconnected(ctx) => {
                if self.on_mqtt_closed(ctx) {
                    self.notify(AppEvent::MqttClosed, "mqtt connection closed");
                }
            }
            UrcEvent::Overflow(_) => {
                self.notify(AppEvent::BufferOverflow, "stream receive overflow")
            }
        }
    }
}
