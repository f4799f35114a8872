//! ISO 11783-5 NAME field (64 bits): the identity carried in every address
//! claim and used to arbitrate conflicting claims (spec.md §4.3).
//!
//! Bit layout and accessor/builder shape ported directly from the
//! teacher's `protocol/managment/iso_name::IsoName`, renamed to the field
//! names spec.md uses (`unique_number` -> `identity_number`,
//! `device_instance_lower/upper` -> `ecu_instance`/`function_instance`,
//! `device_function` -> `function`, `system_instance` ->
//! `device_class_instance`) and with `function` typed as `IsobusFunction`
//! rather than a raw byte, since spec.md's supervisor tracks devices by
//! function. The `Pgn60928`/`defmt`/`ManufacturerCode` lookup-table
//! conversions are dropped with the code generator that produced them
//! (see DESIGN.md).
use std::fmt;

use thiserror::Error;

/// ISOBUS function codes carried in NAME bits 40-47, per
/// ISO 11783-5 Table B.3 (agricultural equipment types).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsobusFunction {
    Tractor,
    Tillage,
    SecondaryTillage,
    PlantersSeeders,
    Fertilizers,
    Sprayers,
    Harvesters,
    RootHarvesters,
    ForageEquipment,
    Irrigation,
    TransportTrailers,
    FarmYardOperations,
    PoweredAuxiliaryDevices,
    SpecialCrops,
    EarthWork,
    RoadTransport,
    /// Any function byte not in ISO 11783-5's agricultural table.
    Other(u8),
}

impl IsobusFunction {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Tractor,
            1 => Self::Tillage,
            2 => Self::SecondaryTillage,
            3 => Self::PlantersSeeders,
            4 => Self::Fertilizers,
            5 => Self::Sprayers,
            6 => Self::Harvesters,
            7 => Self::RootHarvesters,
            8 => Self::ForageEquipment,
            9 => Self::Irrigation,
            10 => Self::TransportTrailers,
            11 => Self::FarmYardOperations,
            12 => Self::PoweredAuxiliaryDevices,
            13 => Self::SpecialCrops,
            14 => Self::EarthWork,
            15 => Self::RoadTransport,
            other => Self::Other(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Tractor => 0,
            Self::Tillage => 1,
            Self::SecondaryTillage => 2,
            Self::PlantersSeeders => 3,
            Self::Fertilizers => 4,
            Self::Sprayers => 5,
            Self::Harvesters => 6,
            Self::RootHarvesters => 7,
            Self::ForageEquipment => 8,
            Self::Irrigation => 9,
            Self::TransportTrailers => 10,
            Self::FarmYardOperations => 11,
            Self::PoweredAuxiliaryDevices => 12,
            Self::SpecialCrops => 13,
            Self::EarthWork => 14,
            Self::RoadTransport => 15,
            Self::Other(code) => code,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IsoNameBuildError {
    #[error("identity number must fit in 21 bits, got {0:#X}")]
    IdentityNumberOutOfRange(u32),
    #[error("manufacturer code must fit in 11 bits, got {0:#X}")]
    ManufacturerCodeOutOfRange(u16),
    #[error("ECU instance must fit in 3 bits, got {0:#X}")]
    EcuInstanceOutOfRange(u8),
    #[error("function instance must fit in 5 bits, got {0:#X}")]
    FunctionInstanceOutOfRange(u8),
    #[error("device class must fit in 7 bits, got {0:#X}")]
    DeviceClassOutOfRange(u8),
    #[error("device class instance must fit in 4 bits, got {0:#X}")]
    DeviceClassInstanceOutOfRange(u8),
    #[error("industry group must fit in 3 bits, got {0:#X}")]
    IndustryGroupOutOfRange(u8),
}

/// The ISO 11783-5 NAME: a 64-bit identity compared lexically to arbitrate
/// competing address claims (lower raw value wins under
/// `ArbitrationPolicy::LowestNameWins`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IsoName(u64);

impl IsoName {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }

    pub const fn identity_number(&self) -> u32 {
        (self.0 & 0x1F_FFFF) as u32
    }

    pub const fn manufacturer_code(&self) -> u16 {
        ((self.0 >> 21) & 0x7FF) as u16
    }

    pub const fn ecu_instance(&self) -> u8 {
        ((self.0 >> 32) & 0x07) as u8
    }

    pub const fn function_instance(&self) -> u8 {
        ((self.0 >> 35) & 0x1F) as u8
    }

    pub fn function(&self) -> IsobusFunction {
        IsobusFunction::from_code(((self.0 >> 40) & 0xFF) as u8)
    }

    pub const fn device_class(&self) -> u8 {
        ((self.0 >> 49) & 0x7F) as u8
    }

    pub const fn device_class_instance(&self) -> u8 {
        ((self.0 >> 56) & 0x0F) as u8
    }

    pub const fn industry_group(&self) -> u8 {
        ((self.0 >> 60) & 0x07) as u8
    }

    pub const fn is_arbitrary_address_capable(&self) -> bool {
        ((self.0 >> 63) & 0x01) != 0
    }

    pub fn builder() -> IsoNameBuilder {
        IsoNameBuilder::default()
    }
}

impl From<u64> for IsoName {
    fn from(raw: u64) -> Self {
        Self::from_raw(raw)
    }
}

impl From<IsoName> for u64 {
    fn from(name: IsoName) -> Self {
        name.raw()
    }
}

impl fmt::Display for IsoName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IsoName {{ identity: {}, mfg: {}, function: {:?}, class: {}, aac: {} }}",
            self.identity_number(),
            self.manufacturer_code(),
            self.function(),
            self.device_class(),
            self.is_arbitrary_address_capable()
        )
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IsoNameBuilder {
    raw: u64,
}

impl IsoNameBuilder {
    pub fn identity_number(mut self, value: u32) -> Result<Self, IsoNameBuildError> {
        if value > 0x1F_FFFF {
            return Err(IsoNameBuildError::IdentityNumberOutOfRange(value));
        }
        self.raw = (self.raw & !0x1F_FFFF) | (value as u64 & 0x1F_FFFF);
        Ok(self)
    }

    pub fn manufacturer_code(mut self, value: u16) -> Result<Self, IsoNameBuildError> {
        if value > 0x7FF {
            return Err(IsoNameBuildError::ManufacturerCodeOutOfRange(value));
        }
        self.raw = (self.raw & !(0x7FF << 21)) | ((value as u64 & 0x7FF) << 21);
        Ok(self)
    }

    pub fn ecu_instance(mut self, value: u8) -> Result<Self, IsoNameBuildError> {
        if value > 0x07 {
            return Err(IsoNameBuildError::EcuInstanceOutOfRange(value));
        }
        self.raw = (self.raw & !(0x07 << 32)) | ((value as u64 & 0x07) << 32);
        Ok(self)
    }

    pub fn function_instance(mut self, value: u8) -> Result<Self, IsoNameBuildError> {
        if value > 0x1F {
            return Err(IsoNameBuildError::FunctionInstanceOutOfRange(value));
        }
        self.raw = (self.raw & !(0x1F << 35)) | ((value as u64 & 0x1F) << 35);
        Ok(self)
    }

    pub fn function(mut self, value: IsobusFunction) -> Self {
        self.raw = (self.raw & !(0xFF << 40)) | ((value.code() as u64) << 40);
        self
    }

    pub fn device_class(mut self, value: u8) -> Result<Self, IsoNameBuildError> {
        if value > 0x7F {
            return Err(IsoNameBuildError::DeviceClassOutOfRange(value));
        }
        self.raw = (self.raw & !(0x7F << 49)) | ((value as u64 & 0x7F) << 49);
        Ok(self)
    }

    pub fn device_class_instance(mut self, value: u8) -> Result<Self, IsoNameBuildError> {
        if value > 0x0F {
            return Err(IsoNameBuildError::DeviceClassInstanceOutOfRange(value));
        }
        self.raw = (self.raw & !(0x0F << 56)) | ((value as u64 & 0x0F) << 56);
        Ok(self)
    }

    pub fn industry_group(mut self, value: u8) -> Result<Self, IsoNameBuildError> {
        if value > 0x07 {
            return Err(IsoNameBuildError::IndustryGroupOutOfRange(value));
        }
        self.raw = (self.raw & !(0x07 << 60)) | ((value as u64 & 0x07) << 60);
        Ok(self)
    }

    pub fn arbitrary_address_capable(mut self, value: bool) -> Self {
        self.raw = (self.raw & !(0x01 << 63)) | ((value as u64) << 63);
        self
    }

    pub fn build(self) -> IsoName {
        IsoName(self.raw)
    }
}
