// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Interface to USB device-controller hardware.
//!
//! The controller hands raw endpoint buffer I/O to the layer above it: a
//! protocol stack registers a [`StatusClient`] for bus-level changes and
//! an [`EndpointClient`] per endpoint for transfer completions, then
//! drives transfers through [`UsbDeviceController`]. Clients are invoked
//! from interrupt context and must not block.

use crate::errorcode::ErrorCode;

/// Direction of an endpoint, named from the host's point of view as the
/// protocol does: OUT carries data to the device, IN to the host.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TransferDirection {
    Out,
    In,
}

/// USB transfer type of an endpoint.
///
/// The discriminants match the hardware encoding of the endpoint-control
/// type field.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TransferType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

/// An endpoint number plus direction, packed the way the protocol encodes
/// endpoint addresses: bits 0-3 are the endpoint number, bit 7 is set for
/// the IN direction.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct EndpointAddress(u8);

const EP_DIR_IN: u8 = 0x80;
const EP_NUM_MASK: u8 = 0x0f;

impl EndpointAddress {
    pub const fn new(index: usize, direction: TransferDirection) -> EndpointAddress {
        let dir = match direction {
            TransferDirection::Out => 0,
            TransferDirection::In => EP_DIR_IN,
        };
        EndpointAddress(index as u8 & EP_NUM_MASK | dir)
    }

    pub const fn index(self) -> usize {
        (self.0 & EP_NUM_MASK) as usize
    }

    pub const fn direction(self) -> TransferDirection {
        if self.0 & EP_DIR_IN != 0 {
            TransferDirection::In
        } else {
            TransferDirection::Out
        }
    }

    pub const fn is_in(self) -> bool {
        self.0 & EP_DIR_IN != 0
    }

    pub const fn is_out(self) -> bool {
        self.0 & EP_DIR_IN == 0
    }
}

impl From<u8> for EndpointAddress {
    fn from(byte: u8) -> EndpointAddress {
        EndpointAddress(byte & (EP_NUM_MASK | EP_DIR_IN))
    }
}

impl From<EndpointAddress> for u8 {
    fn from(address: EndpointAddress) -> u8 {
        address.0
    }
}

/// Transfer events delivered to an endpoint client.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EndpointEvent {
    /// A SETUP packet arrived on this (control) endpoint. Read it out
    /// through the normal read path.
    Setup,
    /// The queued IN transfer on this endpoint completed.
    DataIn,
    /// An OUT transfer completed; received data is ready to read.
    DataOut,
}

/// Bus-level changes delivered to the status client.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BusStatus {
    Connected,
    Disconnected,
    /// The host reset the bus. Endpoint state is not recovered
    /// automatically; the client re-enables the endpoints it uses.
    Reset,
}

/// Receives bus-level status changes. Must not block.
pub trait StatusClient {
    fn bus_status(&self, status: BusStatus);
}

/// Receives transfer events for one endpoint. Must not block.
pub trait EndpointClient {
    fn endpoint_event(&self, endpoint: EndpointAddress, event: EndpointEvent);
}

/// Operations a USB device controller provides to the layer above.
///
/// Every operation resolves its endpoint address first and fails with
/// `INVAL` before touching any register when the index is out of range or
/// the direction does not fit the operation.
pub trait UsbDeviceController<'a> {
    /// Reset and configure the controller, bind the endpoint tables to
    /// their shared-memory slots, and assert the pull-up that announces
    /// the device to the bus.
    fn attach(&self) -> Result<(), ErrorCode>;

    /// Drop off the bus. Not implemented by the base design.
    fn detach(&self) -> Result<(), ErrorCode>;

    /// Register the client receiving bus-level status changes.
    fn set_status_client(&self, client: &'a dyn StatusClient);

    /// Register the client receiving transfer events for one endpoint.
    fn endpoint_set_client(
        &self,
        endpoint: EndpointAddress,
        client: &'a dyn EndpointClient,
    ) -> Result<(), ErrorCode>;

    /// Set the device address. The hardware tracks the address on its
    /// own; this always reports `NOSUPPORT`.
    fn set_address(&self, address: u8) -> Result<(), ErrorCode>;

    /// Store max packet size and transfer type for an endpoint. No
    /// hardware side effect until [`endpoint_enable`].
    ///
    /// [`endpoint_enable`]: UsbDeviceController::endpoint_enable
    fn endpoint_configure(
        &self,
        endpoint: EndpointAddress,
        max_packet_size: u16,
        transfer_type: TransferType,
    ) -> Result<(), ErrorCode>;

    /// Program and enable the endpoint's control word. Endpoint 0 is
    /// always implicitly enabled and succeeds without register access.
    fn endpoint_enable(&self, endpoint: EndpointAddress) -> Result<(), ErrorCode>;

    /// Clear the endpoint's enable bit, leaving the rest of its control
    /// word intact.
    fn endpoint_disable(&self, endpoint: EndpointAddress) -> Result<(), ErrorCode>;

    /// Stall the endpoint.
    fn endpoint_set_stall(&self, endpoint: EndpointAddress) -> Result<(), ErrorCode>;

    /// Unstall the endpoint. Any partially consumed received data is
    /// discarded: the read cursor rewinds to the start of the buffer.
    fn endpoint_clear_stall(&self, endpoint: EndpointAddress) -> Result<(), ErrorCode>;

    fn endpoint_is_stalled(&self, endpoint: EndpointAddress) -> Result<bool, ErrorCode>;

    /// Queue an IN transfer. At most one transfer may be in flight per
    /// endpoint: while the previous one has not completed this fails with
    /// `BUSY` and touches no register. Returns the number of bytes
    /// queued; endpoint 0 clamps to the control-transfer maximum.
    fn endpoint_write(&self, endpoint: EndpointAddress, buf: &[u8]) -> Result<usize, ErrorCode>;

    /// Copy out of the endpoint's receive buffer whatever the last
    /// completed OUT transfer delivered and has not been consumed yet,
    /// advancing the read cursor. With no buffer supplied, reports the
    /// unread byte count without consuming anything. Never blocks.
    fn endpoint_read_wait(
        &self,
        endpoint: EndpointAddress,
        buf: Option<&mut [u8]>,
    ) -> Result<usize, ErrorCode>;

    /// Once the receive buffer is fully drained, a new hardware read
    /// transaction has to be armed for more data to arrive; that re-arm
    /// is missing for endpoints past the control endpoint and reports
    /// `NOSUPPORT`.
    fn endpoint_read_continue(&self, endpoint: EndpointAddress) -> Result<(), ErrorCode>;

    /// [`endpoint_read_wait`] followed by [`endpoint_read_continue`];
    /// fails if either step fails.
    ///
    /// [`endpoint_read_wait`]: UsbDeviceController::endpoint_read_wait
    /// [`endpoint_read_continue`]: UsbDeviceController::endpoint_read_continue
    fn endpoint_read(
        &self,
        endpoint: EndpointAddress,
        buf: Option<&mut [u8]>,
    ) -> Result<usize, ErrorCode>;

    /// Discard anything queued on the endpoint. Not implemented by the
    /// base design; validates the endpoint and succeeds.
    fn endpoint_flush(&self, endpoint: EndpointAddress) -> Result<(), ErrorCode>;

    fn endpoint_max_packet_size(&self, endpoint: EndpointAddress) -> Result<u16, ErrorCode>;
}
