// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Subsystem resets, RP2040

use tock_registers::interfaces::{ReadWriteable, Readable};
use tock_registers::registers::{ReadOnly, ReadWrite};
use tock_registers::{register_bitfields, register_structs};

use crate::utilities::StaticRef;

register_structs! {
    /// Reset controller.
    pub ResetsRegisters {
        /// Reset control. If a bit is set it means the peripheral is in reset.
        (0x000 => reset: ReadWrite<u32, PERIPHERALS::Register>),

        /// Watchdog select. If a bit is set then the watchdog will reset this peripheral.
        (0x004 => wdsel: ReadWrite<u32, PERIPHERALS::Register>),

        /// Reset done. If a bit is set then a reset done signal has been returned by the peripheral.
        (0x008 => reset_done: ReadOnly<u32, PERIPHERALS::Register>),

        /// End
        (0x00c => @END),
    }
}

register_bitfields![u32,
    PERIPHERALS [
        USBCTRL OFFSET(24) NUMBITS(1) [],
        UART1 OFFSET(23) NUMBITS(1) [],
        UART0 OFFSET(22) NUMBITS(1) [],
        TIMER OFFSET(21) NUMBITS(1) [],
        TBMAN OFFSET(20) NUMBITS(1) [],
        SYSINFO OFFSET(19) NUMBITS(1) [],
        SYSCFG OFFSET(18) NUMBITS(1) [],
        SPI1 OFFSET(17) NUMBITS(1) [],
        SPI0 OFFSET(16) NUMBITS(1) [],
        RTC OFFSET(15) NUMBITS(1) [],
        PWM OFFSET(14) NUMBITS(1) [],
        PLL_USB OFFSET(13) NUMBITS(1) [],
        PLL_SYS OFFSET(12) NUMBITS(1) [],
        PIO1 OFFSET(11) NUMBITS(1) [],
        PIO0 OFFSET(10) NUMBITS(1) [],
        PADS_QSPI OFFSET(9) NUMBITS(1) [],
        PADS_BANK0 OFFSET(8) NUMBITS(1) [],
        JTAG OFFSET(7) NUMBITS(1) [],
        IO_QSPI OFFSET(6) NUMBITS(1) [],
        IO_BANK0 OFFSET(5) NUMBITS(1) [],
        I2C1 OFFSET(4) NUMBITS(1) [],
        I2C0 OFFSET(3) NUMBITS(1) [],
        DMA OFFSET(2) NUMBITS(1) [],
        BUSCTRL OFFSET(1) NUMBITS(1) [],
        ADC OFFSET(0) NUMBITS(1) []
    ]
];

pub const RESETS_BASE: StaticRef<ResetsRegisters> =
    unsafe { StaticRef::new(0x4000c000 as *const ResetsRegisters) };

pub struct Resets {
    registers: StaticRef<ResetsRegisters>,
}

impl Resets {
    pub const fn new(registers: StaticRef<ResetsRegisters>) -> Resets {
        Resets { registers }
    }

    /// Put the USB controller into reset.
    pub fn reset_usb_controller(&self) {
        self.registers.reset.modify(PERIPHERALS::USBCTRL::SET);
    }

    /// Release the USB controller from reset and spin until it reports
    /// its reset sequence finished.
    pub fn unreset_usb_controller_wait(&self) {
        self.registers.reset.modify(PERIPHERALS::USBCTRL::CLEAR);
        while !self.registers.reset_done.is_set(PERIPHERALS::USBCTRL) {}
    }
}
