//! Register-level driver for the X-Powers AXP192 PMU fitted to the T-Beam.

use core::fmt;

use embedded_hal::i2c::I2c;

use super::{InterruptCause, PowerRail};

/// Fixed 7-bit bus address.
pub const ADDRESS: u8 = 0x34;
/// Value of the chip-id register on an AXP192.
pub const CHIP_ID: u8 = 0x03;

const REG_CHIP_ID: u8 = 0x03;
const REG_POWER_OUTPUT: u8 = 0x12;
const REG_OFF_CONTROL: u8 = 0x32;
const REG_BATTERY_VOLTAGE_H8: u8 = 0x78;
const REG_BATTERY_VOLTAGE_L4: u8 = 0x79;
const REG_ADC_ENABLE_1: u8 = 0x82;

const IRQ_ENABLE: [u8; 5] = [0x40, 0x41, 0x42, 0x43, 0x4A];
const IRQ_STATUS: [u8; 5] = [0x44, 0x45, 0x46, 0x47, 0x4D];

/// PEK bits live in the third enable/status register.
const PEK_BANK: usize = 2;
const PEK_LONG_PRESS: u8 = 1 << 0;
const PEK_SHORT_PRESS: u8 = 1 << 1;

const OFF_CONTROL_SHUTDOWN: u8 = 1 << 7;
const ADC_BATTERY_VOLTAGE: u8 = 1 << 7;

/// Battery ADC resolution in microvolts per LSB.
const BATTERY_MICROVOLTS_PER_LSB: u32 = 1_100;

/// Driver failures.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Axp192Error<E> {
    Bus(E),
    /// Something answered at the address but its chip id is wrong.
    UnknownChip(u8),
}

impl<E> From<E> for Axp192Error<E> {
    fn from(error: E) -> Self {
        Axp192Error::Bus(error)
    }
}

impl<E: fmt::Debug> fmt::Display for Axp192Error<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axp192Error::Bus(error) => write!(f, "i2c error: {error:?}"),
            Axp192Error::UnknownChip(id) => write!(f, "unexpected chip id 0x{id:02x}"),
        }
    }
}

const fn rail_bit(rail: PowerRail) -> u8 {
    match rail {
        PowerRail::Auxiliary => 1 << 0,
        PowerRail::Lora => 1 << 2,
        PowerRail::Gps => 1 << 3,
        PowerRail::External => 1 << 6,
    }
}

/// AXP192 on an [`I2c`] bus.
pub struct Axp192<I2C> {
    i2c: I2C,
}

impl<I2C: I2c> Axp192<I2C> {
    #[must_use]
    pub const fn new(i2c: I2C) -> Self {
        Self { i2c }
    }

    /// Gives the bus back.
    #[must_use]
    pub fn release(self) -> I2C {
        self.i2c
    }

    /// Confirms the PMU is present and is an AXP192.
    ///
    /// # Errors
    ///
    /// [`Axp192Error::Bus`] when nothing acknowledges, [`Axp192Error::UnknownChip`]
    /// when the id register holds another value.
    pub fn detect(&mut self) -> Result<(), Axp192Error<I2C::Error>> {
        match self.read(REG_CHIP_ID)? {
            CHIP_ID => Ok(()),
            other => Err(Axp192Error::UnknownChip(other)),
        }
    }

    /// # Errors
    ///
    /// Propagates bus failures.
    pub fn set_rail(&mut self, rail: PowerRail, on: bool) -> Result<(), Axp192Error<I2C::Error>> {
        self.update_bits(REG_POWER_OUTPUT, rail_bit(rail), on)
    }

    /// # Errors
    ///
    /// Propagates bus failures.
    pub fn enable_battery_adc(&mut self, on: bool) -> Result<(), Axp192Error<I2C::Error>> {
        self.update_bits(REG_ADC_ENABLE_1, ADC_BATTERY_VOLTAGE, on)
    }

    /// Averaged battery voltage in millivolts.
    ///
    /// # Errors
    ///
    /// Propagates bus failures.
    pub fn battery_millivolts(&mut self) -> Result<u32, Axp192Error<I2C::Error>> {
        let high = self.read(REG_BATTERY_VOLTAGE_H8)?;
        let low = self.read(REG_BATTERY_VOLTAGE_L4)?;
        let raw = (u32::from(high) << 4) | u32::from(low & 0x0F);
        Ok(raw * BATTERY_MICROVOLTS_PER_LSB / 1_000)
    }

    /// # Errors
    ///
    /// Propagates bus failures.
    pub fn enable_long_press_irq(&mut self, on: bool) -> Result<(), Axp192Error<I2C::Error>> {
        self.update_bits(IRQ_ENABLE[PEK_BANK], PEK_LONG_PRESS, on)
    }

    /// Raw contents of the five status registers.
    ///
    /// # Errors
    ///
    /// Propagates bus failures.
    pub fn read_irq_status(&mut self) -> Result<[u8; 5], Axp192Error<I2C::Error>> {
        let mut status = [0u8; 5];
        for (slot, reg) in status.iter_mut().zip(IRQ_STATUS) {
            *slot = self.read(reg)?;
        }
        Ok(status)
    }

    /// Reads the status registers and decodes the button cause. Long press wins
    /// when both bits are latched.
    ///
    /// # Errors
    ///
    /// Propagates bus failures.
    pub fn classify_irq(&mut self) -> Result<InterruptCause, Axp192Error<I2C::Error>> {
        let status = self.read_irq_status()?;
        Ok(decode_pek(status[PEK_BANK]))
    }

    /// Acknowledges every latched interrupt.
    ///
    /// # Errors
    ///
    /// Propagates bus failures.
    pub fn clear_irq(&mut self) -> Result<(), Axp192Error<I2C::Error>> {
        for reg in IRQ_STATUS {
            self.write(reg, 0xFF)?;
        }
        Ok(())
    }

    /// Cuts every output. The MCU loses power before this returns on hardware.
    ///
    /// # Errors
    ///
    /// Propagates bus failures.
    pub fn shutdown(&mut self) -> Result<(), Axp192Error<I2C::Error>> {
        self.update_bits(REG_OFF_CONTROL, OFF_CONTROL_SHUTDOWN, true)
    }

    fn read(&mut self, reg: u8) -> Result<u8, I2C::Error> {
        let mut value = [0u8];
        self.i2c.write_read(ADDRESS, &[reg], &mut value)?;
        Ok(value[0])
    }

    fn write(&mut self, reg: u8, value: u8) -> Result<(), I2C::Error> {
        self.i2c.write(ADDRESS, &[reg, value])
    }

    fn update_bits(
        &mut self,
        reg: u8,
        mask: u8,
        set: bool,
    ) -> Result<(), Axp192Error<I2C::Error>> {
        let current = self.read(reg)?;
        let next = if set { current | mask } else { current & !mask };
        if next != current {
            self.write(reg, next)?;
        }
        Ok(())
    }
}

const fn decode_pek(status: u8) -> InterruptCause {
    if status & PEK_LONG_PRESS != 0 {
        InterruptCause::LongPress
    } else if status & PEK_SHORT_PRESS != 0 {
        InterruptCause::ShortPress
    } else {
        InterruptCause::None
    }
}
