use crate::mmio::{Field, RegisterBus};
use core::fmt;

/// STM32F103 reset and clock control block.
pub const RCC_BASE: u32 = 0x4002_1000;

const RCC_CR: u32 = RCC_BASE; // clock control
const RCC_CFGR: u32 = RCC_BASE + 0x04; // clock configuration
const RCC_APB2ENR: u32 = RCC_BASE + 0x18; // APB2 peripheral clock enable

const PLL_ON: Field = Field::bit(RCC_CR, 24);
const PLL_RDY: Field = Field::bit(RCC_CR, 25);
const SW: Field = Field::new(RCC_CFGR, 0, 2);
const PPRE1: Field = Field::new(RCC_CFGR, 8, 3);
const PPRE2: Field = Field::new(RCC_CFGR, 11, 3);
const PLL_MUL: Field = Field::new(RCC_CFGR, 18, 4);

/// System clock source (CFGR.SW encoding).
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ClockSource {
    Hsi = 0b00,
    Hse = 0b01,
    Pll = 0b10,
}

/// PLL multiplication factor (CFGR.PLLMUL encoding).
///
/// The hardware latches this field only while the PLL is disabled.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PllMul {
    Mul4 = 0b0010,
    Mul5 = 0b0011,
    Mul6 = 0b0100,
    Mul7 = 0b0101,
    Mul8 = 0b0110,
    Mul9 = 0b0111,
    Mul10 = 0b1000,
    Mul11 = 0b1001,
    Mul12 = 0b1010,
    Mul13 = 0b1011,
    Mul14 = 0b1100,
    Mul15 = 0b1101,
    Mul16 = 0b1110,
}

impl PllMul {
    /// Multiplication factor as a plain integer.
    pub const fn factor(self) -> u32 {
        self as u32 + 2
    }
}

/// APB bus prescaler (CFGR.PPRE1 / CFGR.PPRE2 encoding).
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ApbPrescaler {
    Div1 = 0b000,
    Div2 = 0b100,
    Div4 = 0b101,
    Div8 = 0b110,
    Div16 = 0b111,
}

impl ApbPrescaler {
    pub const fn divisor(self) -> u32 {
        match self {
            ApbPrescaler::Div1 => 1,
            ApbPrescaler::Div2 => 2,
            ApbPrescaler::Div4 => 4,
            ApbPrescaler::Div8 => 8,
            ApbPrescaler::Div16 => 16,
        }
    }
}

/// A named, immutable clock-tree configuration.
///
/// The shipped profiles are pre-vetted against the datasheet bus limits:
/// the low-speed (APB1) bus stays at or below half of the high-speed
/// (APB2) bus.
pub struct ClockProfile {
    pub source: ClockSource,
    pub pll_mul: Option<PllMul>,
    /// High-speed bus (APB2) prescaler.
    pub apb2_prescaler: ApbPrescaler,
    /// Low-speed bus (APB1) prescaler.
    pub apb1_prescaler: ApbPrescaler,
    /// Resulting system clock in Hz.
    pub sysclk: u32,
}

impl ClockProfile {
    /// 8 MHz straight from the internal RC oscillator, PLL left off.
    pub const HSI_8MHZ: ClockProfile = ClockProfile {
        source: ClockSource::Hsi,
        pll_mul: None,
        apb2_prescaler: ApbPrescaler::Div2,
        apb1_prescaler: ApbPrescaler::Div4,
        sysclk: 8_000_000,
    };

    /// 32 MHz from the PLL, multiplying the 8 MHz internal source by 4.
    pub const PLL_32MHZ: ClockProfile = ClockProfile {
        source: ClockSource::Pll,
        pll_mul: Some(PllMul::Mul4),
        apb2_prescaler: ApbPrescaler::Div2,
        apb1_prescaler: ApbPrescaler::Div4,
        sysclk: 32_000_000,
    };

    /// Frequency summary this profile produces once applied.
    pub const fn clocks(&self) -> Clocks {
        Clocks {
            sysclk: self.sysclk,
            pclk1: self.sysclk / self.apb1_prescaler.divisor(),
            pclk2: self.sysclk / self.apb2_prescaler.divisor(),
        }
    }
}

/// Bus frequencies derived from an applied profile.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Clocks {
    sysclk: u32,
    pclk1: u32,
    pclk2: u32,
}

impl Clocks {
    pub const fn sysclk(&self) -> u32 {
        self.sysclk
    }

    /// AHB clock. The shipped profiles leave the AHB undivided.
    pub const fn hclk(&self) -> u32 {
        self.sysclk
    }

    pub const fn pclk1(&self) -> u32 {
        self.pclk1
    }

    pub const fn pclk2(&self) -> u32 {
        self.pclk2
    }
}

/// Behaviour between PLL enable and the system clock switch.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum LockPolicy {
    /// Issue the switch without waiting for lock. If the PLL never
    /// stabilises the hardware holds the previous source.
    FireAndForget,
    /// Poll the PLL ready flag up to `max_polls` times and fail with
    /// [`Error::PllLockTimeout`] instead of switching.
    WaitForLock { max_polls: u32 },
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Error {
    /// The PLL ready flag did not assert within the configured poll budget.
    PllLockTimeout,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::PllLockTimeout => f.write_str("PLL failed to report lock"),
        }
    }
}

/// Clock-tree configurator.
pub struct Rcc<'a, B: RegisterBus> {
    bus: &'a B,
    policy: LockPolicy,
}

impl<'a, B: RegisterBus> Rcc<'a, B> {
    pub fn new(bus: &'a B) -> Self {
        Rcc {
            bus,
            policy: LockPolicy::FireAndForget,
        }
    }

    pub fn lock_policy(mut self, policy: LockPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Bring the clock tree from its power-on default to `profile`.
    ///
    /// Write order matters to the hardware: the multiplier must land while
    /// the PLL is still disabled, and the source select comes last. Every
    /// field write is an OR-based read-modify-write, so bits outside the
    /// written field keep their value.
    pub fn apply_profile(&self, profile: &ClockProfile) -> Result<Clocks, Error> {
        if let Some(mul) = profile.pll_mul {
            PLL_MUL.set(self.bus, mul as u32);
            PLL_ON.set(self.bus, 1);
            self.wait_for_lock()?;
        }
        PPRE2.set(self.bus, profile.apb2_prescaler as u32);
        PPRE1.set(self.bus, profile.apb1_prescaler as u32);
        SW.set(self.bus, profile.source as u32);
        Ok(profile.clocks())
    }

    fn wait_for_lock(&self) -> Result<(), Error> {
        match self.policy {
            LockPolicy::FireAndForget => Ok(()),
            LockPolicy::WaitForLock { max_polls } => {
                for _ in 0..max_polls {
                    if PLL_RDY.get(self.bus) == 1 {
                        return Ok(());
                    }
                }
                Err(Error::PllLockTimeout)
            }
        }
    }
}

/// Peripherals gated by RCC_APB2ENR, named by gate bit position.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Apb2Peripheral {
    Afio = 0,
    GpioA = 2,
    GpioB = 3,
    GpioC = 4,
    GpioD = 5,
    Adc1 = 9,
    Tim1 = 11,
    Spi1 = 12,
    Usart1 = 14,
}

/// APB2 peripheral clock gates.
pub struct PeripheralClocks<'a, B: RegisterBus> {
    bus: &'a B,
}

impl<'a, B: RegisterBus> PeripheralClocks<'a, B> {
    pub fn new(bus: &'a B) -> Self {
        PeripheralClocks { bus }
    }

    /// Gate `peripheral`'s bus clock on, leaving the other gate bits
    /// untouched. The peripheral's own registers do not respond until this
    /// has run.
    pub fn enable(&self, peripheral: Apb2Peripheral) {
        Field::bit(RCC_APB2ENR, peripheral as u32).set(self.bus, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmio::sim::SimBank;

    // RCC_CR power-on value: HSION, HSIRDY, mid-scale HSITRIM.
    const CR_RESET: u32 = 0x0000_0083;

    fn preset_reset_state(bank: &SimBank) {
        bank.preset(RCC_CR, CR_RESET);
        bank.preset(RCC_CFGR, 0);
    }

    #[test]
    fn pll_profile_encodes_every_field() {
        let bank = SimBank::new();
        preset_reset_state(&bank);

        let clocks = Rcc::new(&bank)
            .apply_profile(&ClockProfile::PLL_32MHZ)
            .unwrap();

        assert_eq!(PLL_MUL.get(&bank), 0b0010); // x4
        assert_eq!(PLL_ON.get(&bank), 1);
        assert_eq!(PPRE2.get(&bank), 0b100); // /2
        assert_eq!(PPRE1.get(&bank), 0b101); // /4
        assert_eq!(SW.get(&bank), ClockSource::Pll as u32);
        assert_eq!(clocks.sysclk(), 32_000_000);
    }

    #[test]
    fn field_writes_preserve_unrelated_register_bits() {
        let bank = SimBank::new();
        preset_reset_state(&bank);
        // Bits owned by other routines: PLLSRC, PLLXTPRE, USBPRE, MCO.
        let foreign_cfgr = (1 << 16) | (1 << 17) | (1 << 22) | (1 << 26);
        bank.preset(RCC_CFGR, foreign_cfgr);

        Rcc::new(&bank)
            .apply_profile(&ClockProfile::PLL_32MHZ)
            .unwrap();

        let owned = PLL_MUL.mask() | PPRE2.mask() | PPRE1.mask() | SW.mask();
        assert_eq!(bank.reg(RCC_CFGR) & !owned, foreign_cfgr);
        assert_eq!(bank.reg(RCC_CR), CR_RESET | PLL_ON.mask());
    }

    #[test]
    fn direct_profile_leaves_the_pll_alone() {
        let bank = SimBank::new();
        preset_reset_state(&bank);

        let clocks = Rcc::new(&bank)
            .apply_profile(&ClockProfile::HSI_8MHZ)
            .unwrap();

        assert_eq!(bank.reg(RCC_CR), CR_RESET);
        assert!(bank
            .writes()
            .iter()
            .all(|&(addr, value)| !(addr == RCC_CFGR && value & PLL_MUL.mask() != 0)));
        assert_eq!(clocks.sysclk(), 8_000_000);
    }

    #[test]
    fn pll_writes_happen_in_hardware_order() {
        let bank = SimBank::new();
        preset_reset_state(&bank);

        Rcc::new(&bank)
            .apply_profile(&ClockProfile::PLL_32MHZ)
            .unwrap();

        let writes = bank.writes();
        let position = |addr: u32, pred: &dyn Fn(u32) -> bool| {
            writes
                .iter()
                .position(|&(a, v)| a == addr && pred(v))
                .unwrap()
        };
        let mul_write = position(RCC_CFGR, &|v| v & PLL_MUL.mask() != 0);
        let enable_write = position(RCC_CR, &|v| v & PLL_ON.mask() != 0);
        let switch_write = position(RCC_CFGR, &|v| v & SW.mask() == ClockSource::Pll as u32);

        assert!(mul_write < enable_write);
        assert!(enable_write < switch_write);
    }

    #[test]
    fn applying_a_profile_twice_is_idempotent() {
        let bank = SimBank::new();
        preset_reset_state(&bank);
        let rcc = Rcc::new(&bank);

        rcc.apply_profile(&ClockProfile::PLL_32MHZ).unwrap();
        let once = bank.snapshot();
        rcc.apply_profile(&ClockProfile::PLL_32MHZ).unwrap();

        assert_eq!(bank.snapshot(), once);
    }

    #[test]
    fn wait_for_lock_times_out_without_switching() {
        let bank = SimBank::new();
        preset_reset_state(&bank);

        let result = Rcc::new(&bank)
            .lock_policy(LockPolicy::WaitForLock { max_polls: 8 })
            .apply_profile(&ClockProfile::PLL_32MHZ);

        assert_eq!(result, Err(Error::PllLockTimeout));
        assert_eq!(SW.get(&bank), 0);
        assert_eq!(PPRE2.get(&bank), 0);
    }

    #[test]
    fn wait_for_lock_proceeds_once_ready() {
        let bank = SimBank::new();
        // Model a PLL that is already reporting lock.
        bank.preset(RCC_CR, CR_RESET | PLL_RDY.mask());

        let result = Rcc::new(&bank)
            .lock_policy(LockPolicy::WaitForLock { max_polls: 8 })
            .apply_profile(&ClockProfile::PLL_32MHZ);

        assert!(result.is_ok());
        assert_eq!(SW.get(&bank), ClockSource::Pll as u32);
    }

    #[test]
    fn enable_sets_only_the_requested_gate_bit() {
        let bank = SimBank::new();
        bank.preset(RCC_APB2ENR, 0xFFFF_FFFB);

        PeripheralClocks::new(&bank).enable(Apb2Peripheral::GpioA);

        assert_eq!(bank.reg(RCC_APB2ENR), 0xFFFF_FFFF);
    }

    #[test]
    fn profiles_keep_the_buses_inside_their_limits() {
        for profile in [&ClockProfile::HSI_8MHZ, &ClockProfile::PLL_32MHZ] {
            let clocks = profile.clocks();
            assert!(clocks.pclk1() <= clocks.pclk2() / 2);
            assert!(clocks.pclk2() <= clocks.hclk());
        }
    }

    #[test]
    fn pll_factor_matches_its_encoding() {
        assert_eq!(PllMul::Mul4.factor(), 4);
        assert_eq!(PllMul::Mul16.factor(), 16);
        assert_eq!(
            ClockProfile::PLL_32MHZ.sysclk,
            8_000_000 * PllMul::Mul4.factor()
        );
    }
}
