#![no_std]
#![no_main]

use panic_rtt_target as _;
use cortex_m_rt::entry;
use rtt_target::{rtt_init_print, rprintln};

use f103c6_bsp::delay::Delay;
use f103c6_bsp::gpio::{Gpio, GPIOA_BASE};
use f103c6_bsp::mmio::Mmio;
use f103c6_bsp::rcc::{
    Apb2Peripheral, ClockProfile, LockPolicy, PeripheralClocks, Rcc,
};

const LED_PIN: u8 = 13;
const BLINK_HZ: u32 = 2;

#[entry]
fn main() -> ! {
    rtt_init_print!();

    // Unsafety: we are running on the device, so the addresses the drivers
    // hand to this bus are real memory-mapped registers.
    let bus = unsafe { Mmio::new() };

    // The port's clock gate must be on before its registers respond.
    PeripheralClocks::new(&bus).enable(Apb2Peripheral::GpioA);

    let rcc = Rcc::new(&bus).lock_policy(LockPolicy::WaitForLock { max_polls: 1_000 });
    let clocks = match rcc.apply_profile(&ClockProfile::PLL_32MHZ) {
        Ok(clocks) => clocks,
        Err(err) => {
            // The hardware keeps running from the oscillator it was on.
            rprintln!("clock setup failed: {}", err);
            ClockProfile::HSI_8MHZ.clocks()
        }
    };
    rprintln!("sysclk: {} Hz", clocks.sysclk());

    let delay = Delay::new(&bus);
    delay.set_sysclk(&clocks);

    let gpioa = Gpio::new(&bus, GPIOA_BASE);
    let led = gpioa.pin(LED_PIN);
    led.set_low().set_mode_output();

    rprintln!("Starting blinky...");

    let half_period = delay.calc_period_ticks(BLINK_HZ * 2);
    loop {
        led.set_high();
        delay.delay_ticks(half_period);

        led.set_low();
        delay.delay_ticks(half_period);
    }
}
