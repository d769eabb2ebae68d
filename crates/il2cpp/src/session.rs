//! The recovery session as a resumable state machine.
//!
//! Every point where the pipeline needs an operator decision is returned to
//! the caller as a [`Step::Prompt`]; the caller answers through
//! [`PendingInput::resume`]. [`initialize`] drives a session to completion
//! with an [`Operator`].

use crate::dump::{self, DumpCheck};
use crate::image::Il2CppImage;
use crate::linker;
use crate::locator::{LocateOutcome, RegistrationLocator, SearchCounts, Strategy};
use crate::metadata::Metadata;
use ilrecover_binary_parser::{detect, ContainerImage, Detection, FatMachO, SliceInfo};
use ilrecover_core::{Address, Config, Error, Result};
use std::fmt;
use tracing::{error, info};

/// A question for the operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prompt {
    /// Pick one slice of a fat container
    SelectSlice(Vec<SliceInfo>),
    /// Load address of a dumped image, zero to continue without one
    DumpAddress,
    CodeRegistration,
    MetadataRegistration,
}

impl fmt::Display for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prompt::SelectSlice(slices) => {
                write!(f, "Select Platform: ")?;
                for slice in slices {
                    let bits = if slice.is_64bit { "64bit" } else { "32bit" };
                    write!(f, "{}.{} ", slice.index + 1, bits)?;
                }
                Ok(())
            }
            Prompt::DumpAddress => write!(f, "Input il2cpp dump address or input 0 to force continue:"),
            Prompt::CodeRegistration => write!(f, "Input CodeRegistration: "),
            Prompt::MetadataRegistration => write!(f, "Input MetadataRegistration: "),
        }
    }
}

/// An operator's answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Zero-based slice index, taken modulo the slice count
    Slice(usize),
    Address(Address),
}

pub enum Step {
    Prompt(PendingInput),
    Done(Recovery),
}

/// A linked metadata and image pair
pub struct Recovery {
    pub metadata: Metadata,
    pub image: Il2CppImage,
    pub strategy: Strategy,
}

/// Session state shared by every stage
pub struct Session {
    metadata: Metadata,
    locator: RegistrationLocator,
}

enum Pending {
    Slice(FatMachO),
    DumpAddress(Il2CppImage),
    CodeRegistration(Il2CppImage),
    MetadataRegistration(Il2CppImage, Address),
}

/// A suspended session waiting for one reply
pub struct PendingInput {
    session: Session,
    pending: Pending,
}

impl PendingInput {
    pub fn prompt(&self) -> Prompt {
        match &self.pending {
            Pending::Slice(fat) => Prompt::SelectSlice(fat.slices()),
            Pending::DumpAddress(_) => Prompt::DumpAddress,
            Pending::CodeRegistration(_) => Prompt::CodeRegistration,
            Pending::MetadataRegistration(..) => Prompt::MetadataRegistration,
        }
    }

    /// Continue the session with the operator's answer
    pub fn resume(self, reply: Reply) -> Result<Step> {
        let prompt = self.prompt();
        let session = self.session;
        match (self.pending, reply) {
            (Pending::Slice(fat), Reply::Slice(index)) => {
                let container = fat.select(index)?;
                session.open(container)
            }
            (Pending::DumpAddress(mut image), Reply::Address(base)) => {
                dump::apply_base(&mut image, base).map_err(fail)?;
                session.locate(image)
            }
            (Pending::CodeRegistration(image), Reply::Address(code)) => Ok(Step::Prompt(PendingInput {
                session,
                pending: Pending::MetadataRegistration(image, code),
            })),
            (Pending::MetadataRegistration(mut image, code), Reply::Address(meta)) => {
                let mut session = session;
                let strategy = session
                    .locator
                    .supply_manual(&mut image, code, meta)
                    .map_err(fail)?;
                session.finish(image, strategy)
            }
            (_, reply) => Err(Error::invalid_input(format!(
                "{:?} does not answer {:?}",
                reply, prompt
            ))),
        }
    }
}

impl Session {
    /// Parse the metadata, detect the binary and run as far as possible
    /// without operator input.
    pub fn start(binary: &[u8], metadata: &[u8], config: &Config) -> Result<Step> {
        let metadata = Metadata::parse(metadata)?;
        let session = Session {
            metadata,
            locator: RegistrationLocator::new(config.host_platform),
        };

        match detect(binary)? {
            Detection::FatMachO(fat) => Ok(Step::Prompt(PendingInput {
                session,
                pending: Pending::Slice(fat),
            })),
            Detection::Image(container) => session.open(container),
        }
    }

    fn suspend(self, pending: Pending) -> Result<Step> {
        Ok(Step::Prompt(PendingInput { session: self, pending }))
    }

    fn search_counts(&self) -> SearchCounts {
        SearchCounts {
            defined_method_count: self.metadata.defined_method_count(),
            type_definition_count: self.metadata.type_definitions.len(),
            image_count: self.metadata.image_definitions.len(),
        }
    }

    fn open(self, container: ContainerImage) -> Result<Step> {
        let mut image = Il2CppImage::new(container);
        image.set_properties(self.metadata.version, self.metadata.metadata_usages_count());
        info!("Il2Cpp Version: {}", image.version());

        match dump::check(&mut image) {
            DumpCheck::NeedsBase => self.suspend(Pending::DumpAddress(image)),
            DumpCheck::NotDumped | DumpCheck::MarkedDumped => self.locate(image),
        }
    }

    fn locate(mut self, mut image: Il2CppImage) -> Result<Step> {
        let counts = self.search_counts();
        match self.locator.locate(&mut image, &counts).map_err(fail)? {
            LocateOutcome::Resolved(strategy) => self.finish(image, strategy),
            LocateOutcome::NeedsManualInput => self.suspend(Pending::CodeRegistration(image)),
        }
    }

    fn finish(mut self, image: Il2CppImage, strategy: Strategy) -> Result<Step> {
        linker::link(&mut self.metadata, &image).map_err(fail)?;
        Ok(Step::Done(Recovery {
            metadata: self.metadata,
            image,
            strategy,
        }))
    }
}

/// The single fault boundary of a session
pub(crate) fn fail(source: Error) -> Error {
    let err = Error::session_failure(source);
    error!("{}", err);
    err
}

/// Answers the session's prompts
pub trait Operator {
    /// Zero-based index of the slice to use
    fn select_slice(&mut self, slices: &[SliceInfo]) -> Result<usize>;

    /// An address for [`Prompt::DumpAddress`], [`Prompt::CodeRegistration`]
    /// or [`Prompt::MetadataRegistration`]
    fn read_address(&mut self, prompt: &Prompt) -> Result<Address>;
}

/// Run a whole session, asking `operator` whenever input is needed
pub fn initialize(
    binary: &[u8],
    metadata: &[u8],
    config: &Config,
    operator: &mut dyn Operator,
) -> Result<Recovery> {
    let mut step = Session::start(binary, metadata, config)?;
    loop {
        match step {
            Step::Done(recovery) => return Ok(recovery),
            Step::Prompt(pending) => {
                let reply = match pending.prompt() {
                    Prompt::SelectSlice(slices) => Reply::Slice(operator.select_slice(&slices)?),
                    prompt => Reply::Address(operator.read_address(&prompt)?),
                };
                step = pending.resume(reply)?;
            }
        }
    }
}

/// Parse a hexadecimal address with an optional `0x` prefix
pub fn parse_hex_address(text: &str) -> Result<Address> {
    let text = text.trim();
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u64::from_str_radix(digits, 16)
        .map(Address::new)
        .map_err(|e| Error::invalid_input(format!("'{}' is not a hex address: {}", text, e)))
}
