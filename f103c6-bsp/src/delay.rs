use crate::mmio::RegisterBus;
use crate::rcc::Clocks;
use core::sync::atomic::{AtomicU32, Ordering};

/// Cortex-M system timer.
const SYST_BASE: u32 = 0xE000_E010;
const SYST_CSR: u32 = SYST_BASE; // control and status
const SYST_RVR: u32 = SYST_BASE + 0x04; // reload value
const SYST_CVR: u32 = SYST_BASE + 0x08; // current value

const SYST_CSR_ENABLE: u32 = 1 << 0;
const SYST_CSR_CLKSOURCE: u32 = 1 << 2;

/// Busy-wait delay driven by the SysTick down-counter.
pub struct Delay<'a, B: RegisterBus> {
    bus: &'a B,
    base_clock: AtomicU32,
}

impl<'a, B: RegisterBus> Delay<'a, B> {
    pub fn new(bus: &'a B) -> Self {
        // Run the counter from the processor clock with a full 24-bit
        // reload, free-running.
        bus.modify(SYST_CSR, |r| r | SYST_CSR_CLKSOURCE);
        bus.write(SYST_RVR, 0xffffff);
        bus.write(SYST_CVR, 0);
        bus.modify(SYST_CSR, |r| r | SYST_CSR_ENABLE);

        Delay {
            bus,
            base_clock: AtomicU32::new(0),
        }
    }

    /// Calibrate tick math against the configured clock tree.
    pub fn set_sysclk(&self, clocks: &Clocks) {
        self.base_clock.store(clocks.hclk(), Ordering::SeqCst);
    }

    pub fn delay_us(&self, us: u32) {
        assert!(us < 10_000);

        let base_clock = self.base_clock.load(Ordering::SeqCst);
        assert!(base_clock > 0);

        let ticks = (us as u64) * (base_clock as u64) / 1_000_000;
        self.delay_ticks(ticks as u32);
    }

    /// Number of ticks in one period of `frequency`.
    pub fn calc_period_ticks(&self, frequency: u32) -> u32 {
        let base_clock = self.base_clock.load(Ordering::SeqCst);
        assert!(base_clock > 0);

        base_clock / frequency
    }

    pub fn delay_ticks(&self, mut ticks: u32) {
        let mut last = self.get_current();
        loop {
            let now = self.get_current();
            let delta = last.wrapping_sub(now) & 0xffffff;

            if delta >= ticks {
                break;
            } else {
                ticks -= delta;
                last = now;
            }
        }
    }

    #[inline(always)]
    fn get_current(&self) -> u32 {
        self.bus.read(SYST_CVR)
    }
}
