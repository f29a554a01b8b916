// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Device-side USB controller, RP2040
//!
//! The controller pairs a register block with a 4 KiB dual-port RAM. Each
//! endpoint direction owns a buffer-control word in the DPRAM and, for
//! endpoints past the control endpoint, an endpoint-control word and a
//! 64-byte data slot assigned by a fixed formula. The hardware raises one
//! interrupt line; [`UsbCtrl::handle_interrupt`] decodes it into SETUP
//! arrival, buffer completions, bus reset and connection changes, and
//! routes those to the clients registered through
//! [`crate::hil::UsbDeviceController`].

use core::cell::Cell;
use core::cmp;

use log::{debug, error, trace, warn};
use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use tock_registers::registers::{ReadOnly, ReadWrite, WriteOnly};
use tock_registers::{register_bitfields, register_structs, RegisterLongName};

use crate::errorcode::ErrorCode;
use crate::hil::{
    BusStatus, EndpointAddress, EndpointClient, EndpointEvent, StatusClient, TransferDirection,
    TransferType, UsbDeviceController,
};
use crate::resets::Resets;
use crate::utilities::cells::{OptionalCell, VolatileCell};
use crate::utilities::StaticRef;

/// Bidirectional endpoint pairs the hardware provides.
pub const N_ENDPOINTS: usize = 16;

/// Largest packet a control transfer carries.
pub const CTRL_MAX_PACKET_SIZE: usize = 64;

const CTRL_ENDPOINT: usize = 0;
const SETUP_PACKET_SIZE: usize = 8;
const DATA_BUFFER_SIZE: usize = 64;

// DPRAM offsets of the data-buffer area, mirrored by the layout of
// `UsbDpram` below.
const EP0_BUFFER_OFFSET: u32 = 0x100;
const EPX_DATA_OFFSET: u32 = 0x180;

register_structs! {
    /// USB device controller registers (USBCTRL_REGS).
    pub UsbRegisters {
        /// Device address and endpoint control
        (0x000 => addr_endp: ReadWrite<u32, ADDR_ENDP::Register>),

        /// Interrupt endpoints 1 through 15, host mode only
        (0x004 => host_addr_endp: [ReadWrite<u32>; 15]),

        /// Main control register
        (0x040 => main_ctrl: ReadWrite<u32, MAIN_CTRL::Register>),

        /// Set the SOF (Start of Frame) frame number in the host controller
        (0x044 => sof_wr: WriteOnly<u32>),

        /// Read the last SOF (Start of Frame) frame number seen
        (0x048 => sof_rd: ReadOnly<u32>),

        /// SIE control register
        (0x04c => sie_ctrl: ReadWrite<u32, SIE_CTRL::Register>),

        /// SIE status register
        (0x050 => sie_status: ReadWrite<u32, SIE_STATUS::Register>),

        /// Interrupt endpoint control register
        (0x054 => int_ep_ctrl: ReadWrite<u32>),

        /// Buffer status register. A set bit means the corresponding
        /// buffer is done; write one to clear.
        (0x058 => buff_status: ReadWrite<u32>),

        /// Which of the double buffers should be handled
        (0x05c => buff_cpu_should_handle: ReadOnly<u32>),

        /// Device only: ignore the buffer control register for this endpoint
        (0x060 => ep_abort: ReadWrite<u32>),

        /// Device only: used in conjunction with EP_ABORT
        (0x064 => ep_abort_done: ReadWrite<u32>),

        /// Device: set in conjunction with the STALL bit in the buffer
        /// control register to send a STALL on EP0
        (0x068 => ep_stall_arm: ReadWrite<u32, EP_STALL_ARM::Register>),

        /// Used by the host controller
        (0x06c => nak_poll: ReadWrite<u32>),

        /// Device: bits set when the INTERRUPT_ON_NAK or INTERRUPT_ON_STALL
        /// bits are set
        (0x070 => ep_status_stall_nak: ReadWrite<u32>),

        /// Where to connect the USB controller
        (0x074 => usb_muxing: ReadWrite<u32, USB_MUXING::Register>),

        /// Overrides for the power signals when the VBUS signals are not
        /// hooked up to GPIO
        (0x078 => usb_pwr: ReadWrite<u32, USB_PWR::Register>),

        /// Direct control of the USB phy
        (0x07c => usbphy_direct: ReadWrite<u32>),

        /// Override enable for each control in usbphy_direct
        (0x080 => usbphy_direct_override: ReadWrite<u32>),

        /// Value to drive to USB PHY
        (0x084 => usbphy_trim: ReadWrite<u32>),

        (0x088 => _reserved0),

        /// Raw interrupts
        (0x08c => intr: ReadOnly<u32, INTR::Register>),

        /// Interrupt enable
        (0x090 => inte: ReadWrite<u32, INTR::Register>),

        /// Interrupt force
        (0x094 => intf: ReadWrite<u32, INTR::Register>),

        /// Interrupt status after masking & forcing
        (0x098 => ints: ReadOnly<u32, INTR::Register>),

        /// End
        (0x09c => @END),
    },

    /// USB dual-port RAM (USBCTRL_DPRAM).
    pub UsbDpram {
        /// Bytes of the last SETUP packet the hardware accepted
        (0x000 => setup_packet: [ReadWrite<u8>; SETUP_PACKET_SIZE]),

        /// Endpoint control words, endpoints 1 through 15
        (0x008 => ep_ctrl: [EpControl; N_ENDPOINTS - 1]),

        /// Buffer control words, endpoints 0 through 15
        (0x080 => ep_buf_ctrl: [EpBufferControl; N_ENDPOINTS]),

        /// Endpoint 0 data buffer (shared by both directions)
        (0x100 => ep0_buf_a: [VolatileCell<u8>; DATA_BUFFER_SIZE]),

        /// Endpoint 0 optional second buffer, double buffering only
        (0x140 => ep0_buf_b: [VolatileCell<u8>; DATA_BUFFER_SIZE]),

        /// Data buffers for endpoints 1 and up
        (0x180 => epx_data: [VolatileCell<u8>; 3712]),

        /// End
        (0x1000 => @END),
    }
}

/// One endpoint pair's control words, IN first.
#[repr(C)]
pub struct EpControl {
    ep_in: ReadWrite<u32, EP_CONTROL::Register>,
    ep_out: ReadWrite<u32, EP_CONTROL::Register>,
}

/// One endpoint pair's buffer-control words, IN first.
#[repr(C)]
pub struct EpBufferControl {
    ep_in: ReadWrite<u32, BUFF_CONTROL::Register>,
    ep_out: ReadWrite<u32, BUFF_CONTROL::Register>,
}

register_bitfields![u32,
    ADDR_ENDP [
        /// Device endpoint to send data to; device mode ignores this
        ENDPOINT OFFSET(16) NUMBITS(4) [],
        /// Device address
        ADDRESS OFFSET(0) NUMBITS(7) []
    ],
    MAIN_CTRL [
        /// Reduced timings for simulation
        SIM_TIMING OFFSET(31) NUMBITS(1) [],
        /// Device mode = 0, Host mode = 1
        HOST_NDEVICE OFFSET(1) NUMBITS(1) [],
        /// Enable controller
        CONTROLLER_EN OFFSET(0) NUMBITS(1) []
    ],
    SIE_CTRL [
        /// Device: set bit in BUFF_STATUS for every buffer completed on EP0
        EP0_INT_STALL OFFSET(31) NUMBITS(1) [],
        /// Device: EP0 single buffered = 0, double buffered = 1
        EP0_DOUBLE_BUF OFFSET(30) NUMBITS(1) [],
        /// Device: set bit in BUFF_STATUS for every buffer completed on EP0
        EP0_INT_1BUF OFFSET(29) NUMBITS(1) [],
        /// Device: set bit in BUFF_STATUS for every 2 buffers completed on EP0
        EP0_INT_2BUF OFFSET(28) NUMBITS(1) [],
        /// Device: set bit in EP_STATUS_STALL_NAK when EP0 sends a NAK
        EP0_INT_NAK OFFSET(27) NUMBITS(1) [],
        /// Direct bus drive enable
        DIRECT_EN OFFSET(26) NUMBITS(1) [],
        /// Direct control of DP
        DIRECT_DP OFFSET(25) NUMBITS(1) [],
        /// Direct control of DM
        DIRECT_DM OFFSET(24) NUMBITS(1) [],
        /// Power down bus transceiver
        TRANSCEIVER_PD OFFSET(18) NUMBITS(1) [],
        /// Device: pull-up strength
        RPU_OPT OFFSET(17) NUMBITS(1) [],
        /// Device: enable pull up resistor
        PULLUP_EN OFFSET(16) NUMBITS(1) [],
        /// Host: enable pull down resistors
        PULLDOWN_EN OFFSET(15) NUMBITS(1) [],
        /// Host: reset bus
        RESET_BUS OFFSET(13) NUMBITS(1) [],
        /// Device: remote wakeup
        RESUME OFFSET(12) NUMBITS(1) [],
        /// Host: enable VBUS
        VBUS_EN OFFSET(11) NUMBITS(1) [],
        /// Host: enable keep alive packet for low speed bus
        KEEP_ALIVE_EN OFFSET(10) NUMBITS(1) [],
        /// Host: enable SOF generation for full speed bus
        SOF_EN OFFSET(9) NUMBITS(1) [],
        /// Host: delay packet until after SOF
        SOF_SYNC OFFSET(8) NUMBITS(1) [],
        /// Host: preamble enable for low speed packets
        PREAMBLE_EN OFFSET(6) NUMBITS(1) [],
        /// Host: stop transaction
        STOP_TRANS OFFSET(4) NUMBITS(1) [],
        /// Host: receive transaction (IN to host)
        RECEIVE_DATA OFFSET(3) NUMBITS(1) [],
        /// Host: send transaction (OUT from host)
        SEND_DATA OFFSET(2) NUMBITS(1) [],
        /// Host: send setup packet
        SEND_SETUP OFFSET(1) NUMBITS(1) [],
        /// Host: start transaction
        START_TRANS OFFSET(0) NUMBITS(1) []
    ],
    SIE_STATUS [
        /// Data sequence error
        DATA_SEQ_ERROR OFFSET(31) NUMBITS(1) [],
        /// ACK received
        ACK_REC OFFSET(30) NUMBITS(1) [],
        /// Host: STALL received
        STALL_REC OFFSET(29) NUMBITS(1) [],
        /// Host: NAK received
        NAK_REC OFFSET(28) NUMBITS(1) [],
        /// RX timeout is raised by both the host and device
        RX_TIMEOUT OFFSET(27) NUMBITS(1) [],
        /// RX overflow is raised by the serial RX engine
        RX_OVERFLOW OFFSET(26) NUMBITS(1) [],
        /// Bit stuff error
        BIT_STUFF_ERROR OFFSET(25) NUMBITS(1) [],
        /// CRC error
        CRC_ERROR OFFSET(24) NUMBITS(1) [],
        /// Device: bus reset received
        BUS_RESET OFFSET(19) NUMBITS(1) [],
        /// Transaction complete
        TRANS_COMPLETE OFFSET(18) NUMBITS(1) [],
        /// Device: setup packet received and acknowledged
        SETUP_REC OFFSET(17) NUMBITS(1) [],
        /// Device: connected
        CONNECTED OFFSET(16) NUMBITS(1) [],
        /// Host: device has initiated a remote resume
        RESUME OFFSET(11) NUMBITS(1) [],
        /// VBUS over current detected
        VBUS_OVER_CURR OFFSET(10) NUMBITS(1) [],
        /// Host: speed of the attached device
        SPEED OFFSET(8) NUMBITS(2) [],
        /// Bus in suspended state
        SUSPENDED OFFSET(4) NUMBITS(1) [],
        /// USB bus line state
        LINE_STATE OFFSET(2) NUMBITS(2) [],
        /// Device: VBUS detected
        VBUS_DETECTED OFFSET(0) NUMBITS(1) []
    ],
    EP_STALL_ARM [
        EP0_OUT OFFSET(1) NUMBITS(1) [],
        EP0_IN OFFSET(0) NUMBITS(1) []
    ],
    USB_MUXING [
        SOFTCON OFFSET(3) NUMBITS(1) [],
        TO_DIGITAL_PAD OFFSET(2) NUMBITS(1) [],
        TO_EXTPHY OFFSET(1) NUMBITS(1) [],
        TO_PHY OFFSET(0) NUMBITS(1) []
    ],
    USB_PWR [
        OVERCURR_DETECT_EN OFFSET(5) NUMBITS(1) [],
        OVERCURR_DETECT OFFSET(4) NUMBITS(1) [],
        VBUS_DETECT_OVERRIDE_EN OFFSET(3) NUMBITS(1) [],
        VBUS_DETECT OFFSET(2) NUMBITS(1) [],
        VBUS_EN_OVERRIDE_EN OFFSET(1) NUMBITS(1) [],
        VBUS_EN OFFSET(0) NUMBITS(1) []
    ],
    INTR [
        /// Raised when any bit in EP_STATUS_STALL_NAK is set
        EP_STALL_NAK OFFSET(19) NUMBITS(1) [],
        /// Raised when any bit in ABORT_DONE is set
        ABORT_DONE OFFSET(18) NUMBITS(1) [],
        /// Device: raised every time the device receives a SOF
        DEV_SOF OFFSET(17) NUMBITS(1) [],
        /// Device: raised when a setup packet is received
        SETUP_REQ OFFSET(16) NUMBITS(1) [],
        /// Device: raised when the device receives a resume from the host
        DEV_RESUME_FROM_HOST OFFSET(15) NUMBITS(1) [],
        /// Device: raised when the device suspend state changes
        DEV_SUSPEND OFFSET(14) NUMBITS(1) [],
        /// Device: raised when the device connection state changes
        DEV_CONN_DIS OFFSET(13) NUMBITS(1) [],
        /// Device: raised when the host resets the bus
        BUS_RESET OFFSET(12) NUMBITS(1) [],
        /// Source: SIE_STATUS.VBUS_DETECTED
        VBUS_DETECT OFFSET(11) NUMBITS(1) [],
        /// Source: SIE_STATUS.STALL_REC
        STALL OFFSET(10) NUMBITS(1) [],
        /// Source: SIE_STATUS.CRC_ERROR
        ERROR_CRC OFFSET(9) NUMBITS(1) [],
        /// Source: SIE_STATUS.BIT_STUFF_ERROR
        ERROR_BIT_STUFF OFFSET(8) NUMBITS(1) [],
        /// Source: SIE_STATUS.RX_OVERFLOW
        ERROR_RX_OVERFLOW OFFSET(7) NUMBITS(1) [],
        /// Source: SIE_STATUS.RX_TIMEOUT
        ERROR_RX_TIMEOUT OFFSET(6) NUMBITS(1) [],
        /// Source: SIE_STATUS.DATA_SEQ_ERROR
        ERROR_DATA_SEQ OFFSET(5) NUMBITS(1) [],
        /// Raised when any bit in BUFF_STATUS is set
        BUFF_STATUS OFFSET(4) NUMBITS(1) [],
        /// Raised every time SIE_STATUS.TRANS_COMPLETE is set
        TRANS_COMPLETE OFFSET(3) NUMBITS(1) [],
        /// Host: raised every time the host sends a SOF
        HOST_SOF OFFSET(2) NUMBITS(1) [],
        /// Host: raised when a device wakes up the host
        HOST_RESUME OFFSET(1) NUMBITS(1) [],
        /// Host: raised when a device is connected or disconnected
        HOST_CONN_DIS OFFSET(0) NUMBITS(1) []
    ],
    EP_CONTROL [
        /// Enable this endpoint
        ENABLE OFFSET(31) NUMBITS(1) [],
        /// This endpoint is double buffered
        DOUBLE_BUFFERED OFFSET(30) NUMBITS(1) [],
        /// Trigger an interrupt for every transferred buffer
        INTERRUPT_PER_BUFF OFFSET(29) NUMBITS(1) [],
        /// Trigger an interrupt for every 2 transferred buffers
        INTERRUPT_PER_DOUBLE_BUFF OFFSET(28) NUMBITS(1) [],
        ENDPOINT_TYPE OFFSET(26) NUMBITS(2) [
            Control = 0,
            Isochronous = 1,
            Bulk = 2,
            Interrupt = 3
        ],
        /// Trigger an interrupt if a STALL is sent
        INTERRUPT_ON_STALL OFFSET(17) NUMBITS(1) [],
        /// Trigger an interrupt if a NAK is sent
        INTERRUPT_ON_NAK OFFSET(16) NUMBITS(1) [],
        /// The address of the data buffer relative to the start of the DPRAM
        BUFFER_ADDRESS OFFSET(0) NUMBITS(16) []
    ],
    BUFF_CONTROL [
        /// Buffer 1 is full
        FULL_1 OFFSET(31) NUMBITS(1) [],
        /// Buffer 1 is the last of this transfer
        LAST_1 OFFSET(30) NUMBITS(1) [],
        /// Data PID of buffer 1
        DATA_PID_1 OFFSET(29) NUMBITS(1) [],
        /// Double-buffer offset for isochronous mode
        DOUBLE_BUFFER_ISO_OFFSET OFFSET(27) NUMBITS(2) [
            Offset128 = 0,
            Offset256 = 1,
            Offset512 = 2,
            Offset1024 = 3
        ],
        /// Buffer 1 is available to the controller
        AVAILABLE_1 OFFSET(26) NUMBITS(1) [],
        /// Transfer length of buffer 1
        LENGTH_1 OFFSET(16) NUMBITS(10) [],
        /// Buffer 0 is full
        FULL_0 OFFSET(15) NUMBITS(1) [],
        /// Buffer 0 is the last of this transfer
        LAST_0 OFFSET(14) NUMBITS(1) [],
        /// Data PID of buffer 0
        DATA_PID_0 OFFSET(13) NUMBITS(1) [],
        /// Reset the buffer selector to buffer 0
        RESET OFFSET(12) NUMBITS(1) [],
        /// Reply with a STALL (valid on EP0 only with EP_STALL_ARM armed)
        STALL OFFSET(11) NUMBITS(1) [],
        /// Buffer 0 is available to the controller
        AVAILABLE_0 OFFSET(10) NUMBITS(1) [],
        /// Transfer length of buffer 0; for OUT buffers the controller
        /// updates it to the number of bytes received
        LENGTH_0 OFFSET(0) NUMBITS(10) []
    ]
];

pub const USBCTRL_BASE: StaticRef<UsbRegisters> =
    unsafe { StaticRef::new(0x50110000 as *const UsbRegisters) };

pub const USBCTRL_DPRAM_BASE: StaticRef<UsbDpram> =
    unsafe { StaticRef::new(0x50100000 as *const UsbDpram) };

// Every RP2040 register can also be written through the atomic aliases
// at fixed offsets inside the peripheral's address window: +0x2000 sets
// the written bits, +0x3000 clears them, without a read-modify-write on
// the bus. Host builds (unit tests against in-memory fakes) have no
// aliases and fall back to an equivalent read-modify-write.
#[cfg(all(target_arch = "arm", target_os = "none"))]
const REG_ALIAS_SET_BITS: usize = 0x2000;
#[cfg(all(target_arch = "arm", target_os = "none"))]
const REG_ALIAS_CLR_BITS: usize = 0x3000;

fn atomic_set_bits<R: RegisterLongName>(register: &ReadWrite<u32, R>, mask: u32) {
    #[cfg(all(target_arch = "arm", target_os = "none"))]
    unsafe {
        let alias = (register as *const ReadWrite<u32, R> as usize + REG_ALIAS_SET_BITS)
            as *mut u32;
        core::ptr::write_volatile(alias, mask);
    }
    #[cfg(not(all(target_arch = "arm", target_os = "none")))]
    register.set(register.get() | mask);
}

fn atomic_clear_bits<R: RegisterLongName>(register: &ReadWrite<u32, R>, mask: u32) {
    #[cfg(all(target_arch = "arm", target_os = "none"))]
    unsafe {
        let alias = (register as *const ReadWrite<u32, R> as usize + REG_ALIAS_CLR_BITS)
            as *mut u32;
        core::ptr::write_volatile(alias, mask);
    }
    #[cfg(not(all(target_arch = "arm", target_os = "none")))]
    register.set(register.get() & !mask);
}

/// Slot number inside `epx_data` for a non-zero endpoint: two consecutive
/// 64-byte slots per endpoint, IN first.
const fn epx_slot(index: usize, direction: TransferDirection) -> usize {
    (index - 1) * 2
        + match direction {
            TransferDirection::In => 0,
            TransferDirection::Out => 1,
        }
}

/// DPRAM offset of an endpoint's data slot, as programmed into the
/// endpoint-control BUFFER_ADDRESS field. Recomputed identically on every
/// attach; slots never overlap.
const fn dpram_buffer_offset(index: usize, direction: TransferDirection) -> u32 {
    if index == CTRL_ENDPOINT {
        EP0_BUFFER_OFFSET
    } else {
        EPX_DATA_OFFSET + (epx_slot(index, direction) * DATA_BUFFER_SIZE) as u32
    }
}

/// Software bookkeeping for one endpoint number in one direction.
struct Endpoint<'a> {
    max_packet_size: Cell<u16>,
    transfer_type: Cell<TransferType>,
    stalled: Cell<bool>,
    client: OptionalCell<&'a dyn EndpointClient>,
    /// Bytes consumed so far from the last completed OUT transfer.
    read_offset: Cell<u32>,
    /// Completion gate, IN side only: true while no transfer is in
    /// flight. Claimed by `endpoint_write`, released when the buffer
    /// completion arrives.
    write_available: Cell<bool>,
    /// Data PID expected on the next transfer: false = DATA0.
    next_pid_data1: Cell<bool>,
}

impl<'a> Endpoint<'a> {
    const fn new() -> Endpoint<'a> {
        Endpoint {
            max_packet_size: Cell::new(0),
            transfer_type: Cell::new(TransferType::Control),
            stalled: Cell::new(false),
            client: OptionalCell::empty(),
            read_offset: Cell::new(0),
            write_available: Cell::new(true),
            next_pid_data1: Cell::new(false),
        }
    }

    /// Back to power-on state. The registered client survives; endpoints
    /// are recycled across attach cycles, not destroyed.
    fn reset(&self) {
        self.max_packet_size.set(0);
        self.transfer_type.set(TransferType::Control);
        self.stalled.set(false);
        self.read_offset.set(0);
        self.write_available.set(true);
        self.next_pid_data1.set(false);
    }

    fn try_claim_write(&self) -> bool {
        if self.write_available.get() {
            self.write_available.set(false);
            true
        } else {
            false
        }
    }

    fn release_write(&self) {
        self.write_available.set(true);
    }
}

/// What one hardware interrupt decodes into. Each variant is consumed
/// synchronously by `dispatch` before the handler returns.
#[derive(Clone, Copy)]
enum ControllerEvent {
    SetupReceived,
    BufferComplete {
        index: usize,
        direction: TransferDirection,
    },
    ConnectionChanged {
        connected: bool,
    },
    BusReset,
}

/// The USB device controller.
///
/// Owns the endpoint state tables and the shared buffer-control memory;
/// all register mutation goes through its operations.
pub struct UsbCtrl<'a> {
    registers: StaticRef<UsbRegisters>,
    dpram: StaticRef<UsbDpram>,
    resets: Resets,
    out_endpoints: [Endpoint<'a>; N_ENDPOINTS],
    in_endpoints: [Endpoint<'a>; N_ENDPOINTS],
    status_client: OptionalCell<&'a dyn StatusClient>,
    /// Set for the duration of `handle_interrupt`, so operations invoked
    /// from a client callback skip the interrupt masking they would do in
    /// thread context.
    in_handler: Cell<bool>,
}

impl<'a> UsbCtrl<'a> {
    pub const fn new(
        registers: StaticRef<UsbRegisters>,
        dpram: StaticRef<UsbDpram>,
        resets: Resets,
    ) -> UsbCtrl<'a> {
        UsbCtrl {
            registers,
            dpram,
            resets,
            out_endpoints: [
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
            ],
            in_endpoints: [
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
                Endpoint::new(),
            ],
            status_client: OptionalCell::empty(),
            in_handler: Cell::new(false),
        }
    }

    fn endpoint(&self, address: EndpointAddress) -> Option<&Endpoint<'a>> {
        let table = match address.direction() {
            TransferDirection::Out => &self.out_endpoints,
            TransferDirection::In => &self.in_endpoints,
        };
        table.get(address.index())
    }

    /// The endpoint-control word. Endpoint 0 does not have one.
    fn endpoint_control(
        &self,
        index: usize,
        direction: TransferDirection,
    ) -> Option<&ReadWrite<u32, EP_CONTROL::Register>> {
        if index == CTRL_ENDPOINT {
            return None;
        }
        let pair = &self.dpram.ep_ctrl[index - 1];
        Some(match direction {
            TransferDirection::In => &pair.ep_in,
            TransferDirection::Out => &pair.ep_out,
        })
    }

    fn buffer_control(
        &self,
        index: usize,
        direction: TransferDirection,
    ) -> &ReadWrite<u32, BUFF_CONTROL::Register> {
        let pair = &self.dpram.ep_buf_ctrl[index];
        match direction {
            TransferDirection::In => &pair.ep_in,
            TransferDirection::Out => &pair.ep_out,
        }
    }

    fn data_buffer(&self, index: usize, direction: TransferDirection) -> &[VolatileCell<u8>] {
        if index == CTRL_ENDPOINT {
            &self.dpram.ep0_buf_a
        } else {
            let start = epx_slot(index, direction) * DATA_BUFFER_SIZE;
            &self.dpram.epx_data[start..start + DATA_BUFFER_SIZE]
        }
    }

    /// Bytes the last completed transfer left in the endpoint's buffer.
    fn delivered_bytes(&self, index: usize, direction: TransferDirection) -> u32 {
        self.buffer_control(index, direction).read(BUFF_CONTROL::LENGTH_0)
    }

    fn clear_dpram(&self) {
        for byte in self.dpram.setup_packet.iter() {
            byte.set(0);
        }
        for pair in self.dpram.ep_ctrl.iter() {
            pair.ep_in.set(0);
            pair.ep_out.set(0);
        }
        for pair in self.dpram.ep_buf_ctrl.iter() {
            pair.ep_in.set(0);
            pair.ep_out.set(0);
        }
        for byte in self.dpram.ep0_buf_a.iter() {
            byte.set(0);
        }
        for byte in self.dpram.ep0_buf_b.iter() {
            byte.set(0);
        }
        for byte in self.dpram.epx_data.iter() {
            byte.set(0);
        }
    }

    /// Arm a fresh hardware receive on an OUT endpoint. The control
    /// endpoint's status-stage flush rides on this as a zero-length read.
    ///
    /// TODO: program the buffer-control word with AVAILABLE_0 and the
    /// expected length so endpoints past 0 actually re-arm.
    fn start_read(&self, endpoint: EndpointAddress) -> Result<(), ErrorCode> {
        if self.endpoint(endpoint).is_none() {
            return Err(ErrorCode::INVAL);
        }
        trace!("start read ep 0x{:02x}", u8::from(endpoint));
        Ok(())
    }

    /// Mirror the freshly received SETUP bytes into the control
    /// endpoint's read path, where the layer above consumes them with a
    /// normal read on EP0 OUT.
    fn prime_setup_read(&self) {
        let buffer = self.data_buffer(CTRL_ENDPOINT, TransferDirection::Out);
        for (i, byte) in self.dpram.setup_packet.iter().enumerate() {
            buffer[i].set(byte.get());
        }
        self.buffer_control(CTRL_ENDPOINT, TransferDirection::Out)
            .write(BUFF_CONTROL::LENGTH_0.val(SETUP_PACKET_SIZE as u32));
        self.out_endpoints[CTRL_ENDPOINT].read_offset.set(0);
        // A SETUP packet resets the data toggle; both sides continue with
        // DATA1.
        self.out_endpoints[CTRL_ENDPOINT].next_pid_data1.set(true);
        self.in_endpoints[CTRL_ENDPOINT].next_pid_data1.set(true);
    }

    /// Decode and service one hardware interrupt. Performs only register
    /// access and synchronous client callbacks; never blocks.
    pub fn handle_interrupt(&self) {
        self.in_handler.set(true);

        let status = self.registers.ints.extract();

        if status.is_set(INTR::SETUP_REQ) {
            atomic_clear_bits(
                &self.registers.sie_status,
                u32::from(SIE_STATUS::SETUP_REC::SET),
            );
            self.prime_setup_read();
            self.dispatch(ControllerEvent::SetupReceived);
        }

        if status.is_set(INTR::BUFF_STATUS) {
            self.drain_buffer_done();
        }

        if status.is_set(INTR::DEV_CONN_DIS) {
            // Re-sample the line state rather than trusting the snapshot,
            // so a quick connect/disconnect pair reports its final state.
            let connected = self.registers.sie_status.is_set(SIE_STATUS::CONNECTED);
            self.dispatch(ControllerEvent::ConnectionChanged { connected });
        }

        if status.is_set(INTR::BUS_RESET) {
            warn!("usb bus reset");
            atomic_clear_bits(
                &self.registers.sie_status,
                u32::from(SIE_STATUS::BUS_RESET::SET),
            );
            self.dispatch(ControllerEvent::BusReset);
        }

        self.in_handler.set(false);
    }

    /// Drain every completed buffer, lowest endpoint first, so no
    /// completion is missed even when several finish between interrupts.
    fn drain_buffer_done(&self) {
        let mut remaining = self.registers.buff_status.get();

        for bit in 0..N_ENDPOINTS * 2 {
            if remaining == 0 {
                break;
            }
            let mask = 1u32 << bit;
            if remaining & mask == 0 {
                continue;
            }

            // Ack the bit before the callback runs.
            atomic_clear_bits(&self.registers.buff_status, mask);
            remaining &= !mask;

            let direction = if bit % 2 == 0 {
                TransferDirection::Out
            } else {
                TransferDirection::In
            };
            self.dispatch(ControllerEvent::BufferComplete {
                index: bit / 2,
                direction,
            });
        }
    }

    fn dispatch(&self, event: ControllerEvent) {
        match event {
            ControllerEvent::SetupReceived => {
                let address = EndpointAddress::new(CTRL_ENDPOINT, TransferDirection::Out);
                self.out_endpoints[CTRL_ENDPOINT]
                    .client
                    .map(|client| client.endpoint_event(address, EndpointEvent::Setup));
            }
            ControllerEvent::BufferComplete { index, direction } => {
                let address = EndpointAddress::new(index, direction);
                match direction {
                    TransferDirection::In => {
                        let endpoint = &self.in_endpoints[index];
                        endpoint.release_write();
                        endpoint
                            .client
                            .map(|client| client.endpoint_event(address, EndpointEvent::DataIn));
                    }
                    TransferDirection::Out => {
                        let endpoint = &self.out_endpoints[index];
                        endpoint.read_offset.set(0);
                        endpoint
                            .client
                            .map(|client| client.endpoint_event(address, EndpointEvent::DataOut));
                    }
                }
            }
            ControllerEvent::ConnectionChanged { connected } => {
                let status = if connected {
                    BusStatus::Connected
                } else {
                    BusStatus::Disconnected
                };
                self.status_client.map(|client| client.bus_status(status));
            }
            ControllerEvent::BusReset => {
                self.status_client
                    .map(|client| client.bus_status(BusStatus::Reset));
            }
        }
    }
}

impl<'a> UsbDeviceController<'a> for UsbCtrl<'a> {
    fn attach(&self) -> Result<(), ErrorCode> {
        self.resets.reset_usb_controller();
        self.resets.unreset_usb_controller_wait();

        // Stale buffer-control state from a prior run must not be
        // misread as valid.
        self.clear_dpram();

        // Mux the controller to the onboard usb phy
        self.registers
            .usb_muxing
            .write(USB_MUXING::TO_PHY::SET + USB_MUXING::SOFTCON::SET);

        // Force VBUS detect so the device thinks it is plugged into a host
        self.registers
            .usb_pwr
            .write(USB_PWR::VBUS_DETECT::SET + USB_PWR::VBUS_DETECT_OVERRIDE_EN::SET);

        // Enable the controller in device mode
        self.registers
            .main_ctrl
            .write(MAIN_CTRL::CONTROLLER_EN::SET);

        // Interrupt on every EP0 transaction
        self.registers.sie_ctrl.write(SIE_CTRL::EP0_INT_1BUF::SET);

        // Interrupt when a buffer is done, when the bus is reset, when a
        // setup packet is received, and on connection status changes
        self.registers.inte.write(
            INTR::BUFF_STATUS::SET
                + INTR::BUS_RESET::SET
                + INTR::DEV_CONN_DIS::SET
                + INTR::SETUP_REQ::SET,
        );

        for endpoint in self.out_endpoints.iter().chain(self.in_endpoints.iter()) {
            endpoint.reset();
        }

        // Present as a full-speed device by pulling DP high
        atomic_set_bits(
            &self.registers.sie_ctrl,
            u32::from(SIE_CTRL::PULLUP_EN::SET),
        );

        debug!("usb device controller attached");
        Ok(())
    }

    fn detach(&self) -> Result<(), ErrorCode> {
        error!("detach not implemented");
        Ok(())
    }

    fn set_status_client(&self, client: &'a dyn StatusClient) {
        self.status_client.set(client);
    }

    fn endpoint_set_client(
        &self,
        endpoint: EndpointAddress,
        client: &'a dyn EndpointClient,
    ) -> Result<(), ErrorCode> {
        debug!("ep 0x{:02x}", u8::from(endpoint));
        let state = self.endpoint(endpoint).ok_or(ErrorCode::INVAL)?;
        state.client.set(client);
        Ok(())
    }

    fn set_address(&self, address: u8) -> Result<(), ErrorCode> {
        debug!("addr {} (0x{:02x})", address, address);
        Err(ErrorCode::NOSUPPORT)
    }

    fn endpoint_configure(
        &self,
        endpoint: EndpointAddress,
        max_packet_size: u16,
        transfer_type: TransferType,
    ) -> Result<(), ErrorCode> {
        let state = self.endpoint(endpoint).ok_or(ErrorCode::INVAL)?;
        if transfer_type == TransferType::Control && endpoint.index() != CTRL_ENDPOINT {
            error!("invalid endpoint configuration: ep 0x{:02x}", u8::from(endpoint));
            return Err(ErrorCode::INVAL);
        }

        debug!(
            "ep 0x{:02x}, previous mps {}, mps {}, type {:?}",
            u8::from(endpoint),
            state.max_packet_size.get(),
            max_packet_size,
            transfer_type
        );

        state.max_packet_size.set(max_packet_size);
        state.transfer_type.set(transfer_type);
        Ok(())
    }

    fn endpoint_enable(&self, endpoint: EndpointAddress) -> Result<(), ErrorCode> {
        debug!("ep 0x{:02x}", u8::from(endpoint));
        let state = self.endpoint(endpoint).ok_or(ErrorCode::INVAL)?;

        match self.endpoint_control(endpoint.index(), endpoint.direction()) {
            // EP0 has no endpoint-control word and is always enabled
            None => Ok(()),
            Some(control) => {
                control.write(
                    EP_CONTROL::ENABLE::SET
                        + EP_CONTROL::INTERRUPT_PER_BUFF::SET
                        + EP_CONTROL::ENDPOINT_TYPE.val(state.transfer_type.get() as u32)
                        + EP_CONTROL::BUFFER_ADDRESS
                            .val(dpram_buffer_offset(endpoint.index(), endpoint.direction())),
                );

                if endpoint.is_out() {
                    self.start_read(endpoint)
                } else {
                    Ok(())
                }
            }
        }
    }

    fn endpoint_disable(&self, endpoint: EndpointAddress) -> Result<(), ErrorCode> {
        debug!("ep 0x{:02x}", u8::from(endpoint));
        if self.endpoint(endpoint).is_none() {
            return Err(ErrorCode::INVAL);
        }

        match self.endpoint_control(endpoint.index(), endpoint.direction()) {
            None => Ok(()),
            Some(control) => {
                control.modify(EP_CONTROL::ENABLE::CLEAR);
                Ok(())
            }
        }
    }

    fn endpoint_set_stall(&self, endpoint: EndpointAddress) -> Result<(), ErrorCode> {
        debug!("ep 0x{:02x}", u8::from(endpoint));
        let state = self.endpoint(endpoint).ok_or(ErrorCode::INVAL)?;

        match self.endpoint_control(endpoint.index(), endpoint.direction()) {
            None => {
                // EP0 stalls are armed through a dedicated register
                let arm = if endpoint.is_out() {
                    EP_STALL_ARM::EP0_OUT::SET
                } else {
                    EP_STALL_ARM::EP0_IN::SET
                };
                atomic_set_bits(&self.registers.ep_stall_arm, u32::from(arm));
            }
            Some(_) => {
                self.buffer_control(endpoint.index(), endpoint.direction())
                    .modify(BUFF_CONTROL::STALL::SET);
            }
        }

        state.stalled.set(true);
        Ok(())
    }

    fn endpoint_clear_stall(&self, endpoint: EndpointAddress) -> Result<(), ErrorCode> {
        debug!("ep 0x{:02x}", u8::from(endpoint));
        let state = self.endpoint(endpoint).ok_or(ErrorCode::INVAL)?;

        match self.endpoint_control(endpoint.index(), endpoint.direction()) {
            None => {
                let arm = if endpoint.is_out() {
                    EP_STALL_ARM::EP0_OUT::SET
                } else {
                    EP_STALL_ARM::EP0_IN::SET
                };
                atomic_clear_bits(&self.registers.ep_stall_arm, u32::from(arm));
            }
            Some(_) => {
                self.buffer_control(endpoint.index(), endpoint.direction())
                    .modify(BUFF_CONTROL::STALL::CLEAR);
            }
        }

        state.stalled.set(false);
        // Whatever was partially consumed is invalid once unstalled
        state.read_offset.set(0);
        Ok(())
    }

    fn endpoint_is_stalled(&self, endpoint: EndpointAddress) -> Result<bool, ErrorCode> {
        debug!("ep 0x{:02x}", u8::from(endpoint));
        let state = self.endpoint(endpoint).ok_or(ErrorCode::INVAL)?;
        Ok(state.stalled.get())
    }

    fn endpoint_write(&self, endpoint: EndpointAddress, buf: &[u8]) -> Result<usize, ErrorCode> {
        debug!("ep 0x{:02x}, len {}", u8::from(endpoint), buf.len());

        if !endpoint.is_in() {
            error!("invalid ep 0x{:02x}", u8::from(endpoint));
            return Err(ErrorCode::INVAL);
        }
        let state = self.endpoint(endpoint).ok_or(ErrorCode::INVAL)?;

        // At most one transfer in flight per IN endpoint
        if !state.try_claim_write() {
            warn!("unable to get write lock on ep 0x{:02x}", u8::from(endpoint));
            return Err(ErrorCode::BUSY);
        }

        // Mask the controller's interrupt while the buffer-control word
        // is in flux, unless already running inside the handler.
        let saved_interrupt_mask = if self.in_handler.get() {
            None
        } else {
            let mask = self.registers.inte.get();
            self.registers.inte.set(0);
            Some(mask)
        };

        let index = endpoint.index();
        let slot = self.data_buffer(index, TransferDirection::In);
        let mut len = cmp::min(buf.len(), slot.len());
        if index == CTRL_ENDPOINT {
            len = cmp::min(len, CTRL_MAX_PACKET_SIZE);
        }

        for (i, byte) in buf[..len].iter().enumerate() {
            slot[i].set(*byte);
        }

        let data1 = state.next_pid_data1.get();
        self.buffer_control(index, TransferDirection::In).write(
            BUFF_CONTROL::FULL_0::SET
                + BUFF_CONTROL::AVAILABLE_0::SET
                + BUFF_CONTROL::DATA_PID_0.val(data1 as u32)
                + BUFF_CONTROL::LENGTH_0.val(len as u32),
        );
        state.next_pid_data1.set(!data1);

        if index == CTRL_ENDPOINT && len > 0 {
            // Wait for an empty packet from the host. This also flushes
            // the transmit path.
            let _ = self.start_read(EndpointAddress::new(CTRL_ENDPOINT, TransferDirection::Out));
        }

        if let Some(mask) = saved_interrupt_mask {
            self.registers.inte.set(mask);
        }

        Ok(len)
    }

    fn endpoint_read_wait(
        &self,
        endpoint: EndpointAddress,
        buf: Option<&mut [u8]>,
    ) -> Result<usize, ErrorCode> {
        let state = self.endpoint(endpoint).ok_or_else(|| {
            error!("invalid ep 0x{:02x}", u8::from(endpoint));
            ErrorCode::INVAL
        })?;
        if !endpoint.is_out() {
            error!("wrong endpoint direction: 0x{:02x}", u8::from(endpoint));
            return Err(ErrorCode::INVAL);
        }

        let index = endpoint.index();
        let offset = state.read_offset.get();
        let available = self
            .delivered_bytes(index, TransferDirection::Out)
            .saturating_sub(offset);

        debug!(
            "ep 0x{:02x}, {}+{} bytes unread",
            u8::from(endpoint),
            offset,
            available
        );

        match buf {
            None => Ok(available as usize),
            Some(buf) => {
                let slot = self.data_buffer(index, TransferDirection::Out);
                let offset = offset as usize;
                let count = cmp::min(available as usize, buf.len());
                let count = cmp::min(count, slot.len().saturating_sub(offset));

                for (i, byte) in buf[..count].iter_mut().enumerate() {
                    *byte = slot[offset + i].get();
                }
                state.read_offset.set((offset + count) as u32);
                Ok(count)
            }
        }
    }

    fn endpoint_read_continue(&self, endpoint: EndpointAddress) -> Result<(), ErrorCode> {
        let state = self.endpoint(endpoint).ok_or(ErrorCode::INVAL)?;
        if !endpoint.is_out() {
            error!("not a valid endpoint: 0x{:02x}", u8::from(endpoint));
            return Err(ErrorCode::INVAL);
        }

        // Fully drained: a new read transaction belongs here, but
        // re-arming past the control endpoint is still missing.
        if self.delivered_bytes(endpoint.index(), TransferDirection::Out)
            == state.read_offset.get()
        {
            debug!("buffer drained, new read transaction required");
            return Err(ErrorCode::NOSUPPORT);
        }

        Ok(())
    }

    fn endpoint_read(
        &self,
        endpoint: EndpointAddress,
        buf: Option<&mut [u8]>,
    ) -> Result<usize, ErrorCode> {
        let count = self.endpoint_read_wait(endpoint, buf)?;
        self.endpoint_read_continue(endpoint)?;
        Ok(count)
    }

    fn endpoint_flush(&self, endpoint: EndpointAddress) -> Result<(), ErrorCode> {
        if self.endpoint(endpoint).is_none() {
            return Err(ErrorCode::INVAL);
        }
        error!("flush not implemented");
        Ok(())
    }

    fn endpoint_max_packet_size(&self, endpoint: EndpointAddress) -> Result<u16, ErrorCode> {
        let state = self.endpoint(endpoint).ok_or(ErrorCode::INVAL)?;
        Ok(state.max_packet_size.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resets::ResetsRegisters;
    use core::cell::RefCell;
    use std::boxed::Box;
    use std::collections::HashSet;
    use std::vec::Vec;

    // The fakes are plain memory: plant the bits hardware would set.
    fn poke<R: RegisterLongName>(register: &ReadOnly<u32, R>, value: u32) {
        unsafe { (register as *const ReadOnly<u32, R> as *mut u32).write_volatile(value) };
    }

    fn fixture<'a>() -> (
        UsbCtrl<'a>,
        &'static UsbRegisters,
        &'static UsbDpram,
        &'static ResetsRegisters,
    ) {
        let registers: &'static UsbRegisters = Box::leak(Box::new(unsafe { core::mem::zeroed() }));
        let dpram: &'static UsbDpram = Box::leak(Box::new(unsafe { core::mem::zeroed() }));
        let resets: &'static ResetsRegisters = Box::leak(Box::new(unsafe { core::mem::zeroed() }));

        // RESET_DONE (offset 0x8) must report the USB block out of reset
        // or attach would spin forever against the fake.
        unsafe {
            (resets as *const ResetsRegisters as *mut u32)
                .add(2)
                .write_volatile(1 << 24)
        };

        let ctrl = UsbCtrl::new(
            unsafe { StaticRef::new(registers) },
            unsafe { StaticRef::new(dpram) },
            Resets::new(unsafe { StaticRef::new(resets) }),
        );
        (ctrl, registers, dpram, resets)
    }

    #[derive(Default)]
    struct EndpointLog {
        events: RefCell<Vec<(EndpointAddress, EndpointEvent)>>,
    }

    impl EndpointClient for EndpointLog {
        fn endpoint_event(&self, endpoint: EndpointAddress, event: EndpointEvent) {
            self.events.borrow_mut().push((endpoint, event));
        }
    }

    #[derive(Default)]
    struct StatusLog {
        statuses: RefCell<Vec<BusStatus>>,
    }

    impl StatusClient for StatusLog {
        fn bus_status(&self, status: BusStatus) {
            self.statuses.borrow_mut().push(status);
        }
    }

    fn ep(index: usize, direction: TransferDirection) -> EndpointAddress {
        EndpointAddress::new(index, direction)
    }

    #[test]
    fn attach_leaves_the_documented_controller_state() {
        let (ctrl, registers, dpram, resets) = fixture();

        // Dirty the DPRAM to prove attach clears it.
        dpram.setup_packet[0].set(0xaa);
        dpram.ep_ctrl[4].ep_in.set(0xdead_beef);
        dpram.ep_buf_ctrl[3].ep_out.set(0xdead_beef);
        dpram.epx_data[100].set(0x55);

        assert_eq!(ctrl.attach(), Ok(()));

        for byte in dpram.setup_packet.iter() {
            assert_eq!(byte.get(), 0);
        }
        for pair in dpram.ep_ctrl.iter() {
            assert_eq!(pair.ep_in.get(), 0);
            assert_eq!(pair.ep_out.get(), 0);
        }
        for pair in dpram.ep_buf_ctrl.iter() {
            assert_eq!(pair.ep_in.get(), 0);
            assert_eq!(pair.ep_out.get(), 0);
        }
        for byte in dpram.ep0_buf_a.iter().chain(dpram.ep0_buf_b.iter()) {
            assert_eq!(byte.get(), 0);
        }
        for byte in dpram.epx_data.iter() {
            assert_eq!(byte.get(), 0);
        }

        // Exactly the four designated interrupt sources.
        let expected_inte = (1 << 4) | (1 << 12) | (1 << 13) | (1 << 16);
        assert_eq!(registers.inte.get(), expected_inte);

        // One interrupt per EP0 transaction, and the pull-up asserted
        // without clobbering it.
        assert_eq!(registers.sie_ctrl.get(), (1 << 29) | (1 << 16));
        assert_eq!(registers.main_ctrl.get(), 1);
        assert_eq!(registers.usb_muxing.get(), 0b1001);
        assert_eq!(registers.usb_pwr.get(), 0b1100);

        // The reset cycle ended with the USBCTRL reset bit released.
        let reset_word =
            unsafe { (resets as *const ResetsRegisters as *const u32).read_volatile() };
        assert_eq!(reset_word & (1 << 24), 0);
    }

    #[test]
    fn enable_then_disable_clears_only_the_enable_bit() {
        let (ctrl, _registers, dpram, _resets) = fixture();
        ctrl.attach().unwrap();

        ctrl.endpoint_configure(ep(1, TransferDirection::In), 64, TransferType::Bulk)
            .unwrap();
        ctrl.endpoint_enable(ep(1, TransferDirection::In)).unwrap();

        let enabled = (1 << 31) | (1 << 29) | (2 << 26) | 0x180;
        assert_eq!(dpram.ep_ctrl[0].ep_in.get(), enabled);

        ctrl.endpoint_disable(ep(1, TransferDirection::In)).unwrap();
        assert_eq!(dpram.ep_ctrl[0].ep_in.get(), enabled & !(1 << 31));

        // EP0 has no control word; both calls succeed without one.
        assert_eq!(ctrl.endpoint_enable(ep(0, TransferDirection::In)), Ok(()));
        assert_eq!(ctrl.endpoint_disable(ep(0, TransferDirection::In)), Ok(()));
    }

    #[test]
    fn configure_stores_max_packet_size() {
        let (ctrl, _registers, _dpram, _resets) = fixture();
        ctrl.attach().unwrap();

        ctrl.endpoint_configure(ep(2, TransferDirection::In), 64, TransferType::Bulk)
            .unwrap();
        assert_eq!(
            ctrl.endpoint_max_packet_size(ep(2, TransferDirection::In)),
            Ok(64)
        );
    }

    #[test]
    fn control_type_on_a_nonzero_endpoint_is_rejected() {
        let (ctrl, _registers, _dpram, _resets) = fixture();
        ctrl.attach().unwrap();

        assert_eq!(
            ctrl.endpoint_configure(ep(2, TransferDirection::Out), 64, TransferType::Control),
            Err(ErrorCode::INVAL)
        );
        assert_eq!(
            ctrl.endpoint_configure(ep(0, TransferDirection::Out), 64, TransferType::Control),
            Ok(())
        );
    }

    #[test]
    fn stall_set_query_clear_roundtrip() {
        let (ctrl, registers, dpram, _resets) = fixture();
        ctrl.attach().unwrap();

        // EP0 goes through the stall-arm register.
        ctrl.endpoint_set_stall(ep(0, TransferDirection::Out)).unwrap();
        assert_eq!(registers.ep_stall_arm.get(), 0b10);
        assert_eq!(ctrl.endpoint_is_stalled(ep(0, TransferDirection::Out)), Ok(true));

        ctrl.endpoint_set_stall(ep(0, TransferDirection::In)).unwrap();
        assert_eq!(registers.ep_stall_arm.get(), 0b11);

        ctrl.endpoint_clear_stall(ep(0, TransferDirection::Out)).unwrap();
        ctrl.endpoint_clear_stall(ep(0, TransferDirection::In)).unwrap();
        assert_eq!(registers.ep_stall_arm.get(), 0);
        assert_eq!(ctrl.endpoint_is_stalled(ep(0, TransferDirection::Out)), Ok(false));
        assert_eq!(ctrl.endpoint_is_stalled(ep(0, TransferDirection::In)), Ok(false));

        // Other endpoints stall through their buffer-control word, and
        // unstalling rewinds the read cursor.
        dpram.ep_buf_ctrl[1].ep_out.write(BUFF_CONTROL::LENGTH_0.val(10));
        for (i, value) in (10u8..20).enumerate() {
            dpram.epx_data[64 + i].set(value);
        }
        let mut buf = [0u8; 3];
        ctrl.endpoint_read_wait(ep(1, TransferDirection::Out), Some(&mut buf))
            .unwrap();

        ctrl.endpoint_set_stall(ep(1, TransferDirection::Out)).unwrap();
        assert_eq!(dpram.ep_buf_ctrl[1].ep_out.get(), 10 | (1 << 11));
        assert_eq!(ctrl.endpoint_is_stalled(ep(1, TransferDirection::Out)), Ok(true));

        ctrl.endpoint_clear_stall(ep(1, TransferDirection::Out)).unwrap();
        assert_eq!(dpram.ep_buf_ctrl[1].ep_out.get(), 10);
        assert_eq!(ctrl.endpoint_is_stalled(ep(1, TransferDirection::Out)), Ok(false));
        assert_eq!(
            ctrl.endpoint_read_wait(ep(1, TransferDirection::Out), None),
            Ok(10)
        );
    }

    #[test]
    fn read_wait_copies_from_the_cursor_and_advances_it() {
        let (ctrl, _registers, dpram, _resets) = fixture();
        ctrl.attach().unwrap();

        dpram.ep_buf_ctrl[1].ep_out.write(BUFF_CONTROL::LENGTH_0.val(10));
        for (i, value) in (10u8..20).enumerate() {
            dpram.epx_data[64 + i].set(value);
        }

        let mut first = [0u8; 3];
        assert_eq!(
            ctrl.endpoint_read_wait(ep(1, TransferDirection::Out), Some(&mut first)),
            Ok(3)
        );
        assert_eq!(first, [10, 11, 12]);

        let mut second = [0u8; 5];
        assert_eq!(
            ctrl.endpoint_read_wait(ep(1, TransferDirection::Out), Some(&mut second)),
            Ok(5)
        );
        assert_eq!(second, [13, 14, 15, 16, 17]);

        assert_eq!(
            ctrl.endpoint_read_wait(ep(1, TransferDirection::Out), None),
            Ok(2)
        );
    }

    #[test]
    fn drained_read_reports_nosupport() {
        let (ctrl, _registers, dpram, _resets) = fixture();
        ctrl.attach().unwrap();

        dpram.ep_buf_ctrl[1].ep_out.write(BUFF_CONTROL::LENGTH_0.val(4));
        for i in 0..4 {
            dpram.epx_data[64 + i].set(i as u8);
        }

        let mut buf = [0u8; 4];
        assert_eq!(
            ctrl.endpoint_read(ep(1, TransferDirection::Out), Some(&mut buf)),
            Err(ErrorCode::NOSUPPORT)
        );
        assert_eq!(buf, [0, 1, 2, 3]);

        // Not yet drained: continue succeeds.
        dpram.ep_buf_ctrl[2].ep_out.write(BUFF_CONTROL::LENGTH_0.val(4));
        let mut partial = [0u8; 2];
        assert_eq!(
            ctrl.endpoint_read(ep(2, TransferDirection::Out), Some(&mut partial)),
            Ok(2)
        );
    }

    #[test]
    fn wrong_direction_operations_are_rejected() {
        let (ctrl, _registers, _dpram, _resets) = fixture();
        ctrl.attach().unwrap();

        assert_eq!(
            ctrl.endpoint_write(ep(1, TransferDirection::Out), &[0]),
            Err(ErrorCode::INVAL)
        );
        assert_eq!(
            ctrl.endpoint_read_wait(ep(1, TransferDirection::In), None),
            Err(ErrorCode::INVAL)
        );
        assert_eq!(
            ctrl.endpoint_read_continue(ep(1, TransferDirection::In)),
            Err(ErrorCode::INVAL)
        );
    }

    #[test]
    fn write_queues_the_buffer_and_toggles_the_data_pid() {
        let (ctrl, _registers, dpram, _resets) = fixture();
        ctrl.attach().unwrap();

        ctrl.endpoint_configure(ep(1, TransferDirection::In), 64, TransferType::Bulk)
            .unwrap();
        ctrl.endpoint_enable(ep(1, TransferDirection::In)).unwrap();

        assert_eq!(
            ctrl.endpoint_write(ep(1, TransferDirection::In), &[1, 2, 3, 4]),
            Ok(4)
        );

        // LENGTH | FULL | AVAILABLE, DATA0.
        assert_eq!(dpram.ep_buf_ctrl[1].ep_in.get(), 4 | (1 << 15) | (1 << 10));
        assert_eq!(dpram.epx_data[0].get(), 1);
        assert_eq!(dpram.epx_data[3].get(), 4);
        assert!(ctrl.in_endpoints[1].next_pid_data1.get());
    }

    #[test]
    fn write_with_gate_held_reports_busy_and_leaves_registers_alone() {
        let (ctrl, registers, dpram, _resets) = fixture();
        ctrl.attach().unwrap();

        ctrl.endpoint_configure(ep(1, TransferDirection::In), 64, TransferType::Bulk)
            .unwrap();
        ctrl.endpoint_enable(ep(1, TransferDirection::In)).unwrap();
        ctrl.endpoint_write(ep(1, TransferDirection::In), &[1, 2, 3, 4])
            .unwrap();

        let inte = registers.inte.get();
        let buffer_control = dpram.ep_buf_ctrl[1].ep_in.get();
        let endpoint_control = dpram.ep_ctrl[0].ep_in.get();
        let toggle = ctrl.in_endpoints[1].next_pid_data1.get();

        assert_eq!(
            ctrl.endpoint_write(ep(1, TransferDirection::In), &[5, 6]),
            Err(ErrorCode::BUSY)
        );

        assert_eq!(registers.inte.get(), inte);
        assert_eq!(dpram.ep_buf_ctrl[1].ep_in.get(), buffer_control);
        assert_eq!(dpram.ep_ctrl[0].ep_in.get(), endpoint_control);
        assert_eq!(ctrl.in_endpoints[1].next_pid_data1.get(), toggle);
    }

    #[test]
    fn in_completion_releases_the_write_gate() {
        let (ctrl, registers, _dpram, _resets) = fixture();
        ctrl.attach().unwrap();

        ctrl.endpoint_configure(ep(1, TransferDirection::In), 64, TransferType::Bulk)
            .unwrap();
        ctrl.endpoint_enable(ep(1, TransferDirection::In)).unwrap();

        ctrl.endpoint_write(ep(1, TransferDirection::In), &[1]).unwrap();
        assert_eq!(
            ctrl.endpoint_write(ep(1, TransferDirection::In), &[2]),
            Err(ErrorCode::BUSY)
        );

        // Endpoint 1 IN completes: bit 2*1+1.
        registers.buff_status.set(1 << 3);
        poke(&registers.ints, 1 << 4);
        ctrl.handle_interrupt();

        assert_eq!(ctrl.endpoint_write(ep(1, TransferDirection::In), &[2]), Ok(1));
    }

    #[test]
    fn control_write_clamps_to_the_control_maximum() {
        let (ctrl, _registers, dpram, _resets) = fixture();
        ctrl.attach().unwrap();

        let data = [0xab; 80];
        assert_eq!(
            ctrl.endpoint_write(ep(0, TransferDirection::In), &data),
            Ok(CTRL_MAX_PACKET_SIZE)
        );
        assert_eq!(
            dpram.ep_buf_ctrl[0].ep_in.read(BUFF_CONTROL::LENGTH_0),
            CTRL_MAX_PACKET_SIZE as u32
        );
    }

    #[test]
    fn write_restores_the_interrupt_mask() {
        let (ctrl, registers, _dpram, _resets) = fixture();
        ctrl.attach().unwrap();

        ctrl.endpoint_configure(ep(1, TransferDirection::In), 64, TransferType::Bulk)
            .unwrap();
        ctrl.endpoint_enable(ep(1, TransferDirection::In)).unwrap();

        let inte = registers.inte.get();
        ctrl.endpoint_write(ep(1, TransferDirection::In), &[1, 2]).unwrap();
        assert_eq!(registers.inte.get(), inte);
    }

    #[test]
    fn buffer_done_bitmap_dispatches_exactly_the_set_bits() {
        let (ctrl, registers, _dpram, _resets) = fixture();
        ctrl.attach().unwrap();

        let log = EndpointLog::default();
        let quiet = EndpointLog::default();
        ctrl.endpoint_set_client(ep(1, TransferDirection::Out), &log).unwrap();
        ctrl.endpoint_set_client(ep(1, TransferDirection::In), &log).unwrap();
        ctrl.endpoint_set_client(ep(2, TransferDirection::Out), &quiet).unwrap();
        ctrl.endpoint_set_client(ep(2, TransferDirection::In), &quiet).unwrap();

        // Endpoint 1 OUT (bit 2) and endpoint 1 IN (bit 3) both done.
        registers.buff_status.set(0b1100);
        poke(&registers.ints, 1 << 4);
        ctrl.handle_interrupt();

        assert_eq!(
            *log.events.borrow(),
            vec![
                (EndpointAddress::from(0x01), EndpointEvent::DataOut),
                (EndpointAddress::from(0x81), EndpointEvent::DataIn),
            ]
        );
        assert!(quiet.events.borrow().is_empty());
        assert_eq!(registers.buff_status.get(), 0);
    }

    #[test]
    fn out_completion_rewinds_the_read_cursor() {
        let (ctrl, registers, dpram, _resets) = fixture();
        ctrl.attach().unwrap();

        dpram.ep_buf_ctrl[1].ep_out.write(BUFF_CONTROL::LENGTH_0.val(6));
        let mut buf = [0u8; 6];
        ctrl.endpoint_read_wait(ep(1, TransferDirection::Out), Some(&mut buf))
            .unwrap();
        assert_eq!(
            ctrl.endpoint_read_wait(ep(1, TransferDirection::Out), None),
            Ok(0)
        );

        registers.buff_status.set(1 << 2);
        poke(&registers.ints, 1 << 4);
        ctrl.handle_interrupt();

        assert_eq!(
            ctrl.endpoint_read_wait(ep(1, TransferDirection::Out), None),
            Ok(6)
        );
    }

    #[test]
    fn setup_interrupt_primes_the_control_read_path() {
        let (ctrl, registers, dpram, _resets) = fixture();
        ctrl.attach().unwrap();

        let log = EndpointLog::default();
        ctrl.endpoint_set_client(ep(0, TransferDirection::Out), &log).unwrap();

        let setup = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x40, 0x00];
        for (i, byte) in setup.iter().enumerate() {
            dpram.setup_packet[i].set(*byte);
        }
        registers.sie_status.write(SIE_STATUS::SETUP_REC::SET);
        poke(&registers.ints, 1 << 16);

        ctrl.handle_interrupt();

        assert_eq!(
            *log.events.borrow(),
            vec![(EndpointAddress::from(0x00), EndpointEvent::Setup)]
        );
        assert!(!registers.sie_status.is_set(SIE_STATUS::SETUP_REC));

        let mut buf = [0u8; 8];
        assert_eq!(
            ctrl.endpoint_read_wait(ep(0, TransferDirection::Out), Some(&mut buf)),
            Ok(8)
        );
        assert_eq!(buf, setup);

        // Both sides of EP0 answer a SETUP with DATA1.
        assert!(ctrl.in_endpoints[0].next_pid_data1.get());
        assert!(ctrl.out_endpoints[0].next_pid_data1.get());
    }

    #[test]
    fn connection_change_reports_resampled_state() {
        let (ctrl, registers, _dpram, _resets) = fixture();
        ctrl.attach().unwrap();

        let log = StatusLog::default();
        ctrl.set_status_client(&log);

        registers.sie_status.write(SIE_STATUS::CONNECTED::SET);
        poke(&registers.ints, 1 << 13);
        ctrl.handle_interrupt();

        registers.sie_status.set(0);
        poke(&registers.ints, 1 << 13);
        ctrl.handle_interrupt();

        assert_eq!(
            *log.statuses.borrow(),
            vec![BusStatus::Connected, BusStatus::Disconnected]
        );
    }

    #[test]
    fn bus_reset_acks_and_notifies() {
        let (ctrl, registers, _dpram, _resets) = fixture();
        ctrl.attach().unwrap();

        let log = StatusLog::default();
        ctrl.set_status_client(&log);

        registers.sie_status.write(SIE_STATUS::BUS_RESET::SET);
        poke(&registers.ints, 1 << 12);
        ctrl.handle_interrupt();

        assert_eq!(*log.statuses.borrow(), vec![BusStatus::Reset]);
        assert!(!registers.sie_status.is_set(SIE_STATUS::BUS_RESET));
    }

    #[test]
    fn data_buffer_slots_are_disjoint() {
        let mut starts = HashSet::new();

        for index in 1..N_ENDPOINTS {
            for direction in [TransferDirection::In, TransferDirection::Out] {
                let start = dpram_buffer_offset(index, direction);
                let end = start + DATA_BUFFER_SIZE as u32;

                // Clear of EP0's fixed slot and inside the DPRAM.
                assert!(start >= EPX_DATA_OFFSET, "ep {} overlaps the EP0 area", index);
                assert!(end <= 0x1000, "ep {} runs past the DPRAM", index);
                assert_eq!(start % DATA_BUFFER_SIZE as u32, 0);

                // 64-byte aligned and pairwise distinct means disjoint.
                assert!(starts.insert(start), "ep {} shares a slot", index);
            }
        }

        assert_eq!(dpram_buffer_offset(0, TransferDirection::In), 0x100);
        assert_eq!(dpram_buffer_offset(0, TransferDirection::Out), 0x100);
    }

    #[test]
    fn set_address_is_unsupported_and_flush_validates_only() {
        let (ctrl, _registers, dpram, _resets) = fixture();
        ctrl.attach().unwrap();

        assert_eq!(ctrl.set_address(5), Err(ErrorCode::NOSUPPORT));
        assert_eq!(ctrl.endpoint_flush(ep(1, TransferDirection::In)), Ok(()));
        for pair in dpram.ep_buf_ctrl.iter() {
            assert_eq!(pair.ep_in.get(), 0);
            assert_eq!(pair.ep_out.get(), 0);
        }
    }
}
