//! Registration locator: runs the search strategies in priority order and
//! falls back to operator-supplied addresses

use ilrecover_core::{Address, BinaryFormat, Error, HostPlatform, Result};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// Metadata counts the counts-driven heuristic validates against
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchCounts {
    pub defined_method_count: usize,
    pub type_definition_count: usize,
    pub image_count: usize,
}

/// The strategy that produced the registration addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    PlusSearch,
    Search,
    SymbolSearch,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocatorState {
    Unresolved,
    PlusSearchAttempted,
    SearchAttempted,
    SymbolSearchAttempted,
    ManualInput,
    Resolved(Strategy),
    Failed,
}

/// What the locator needs from an image
pub trait RegistrationSearch {
    fn format(&self) -> BinaryFormat;
    fn plus_search(&mut self, counts: &SearchCounts) -> Result<bool>;
    fn search(&mut self) -> Result<bool>;
    fn symbol_search(&mut self) -> Result<bool>;
    fn init(&mut self, code_registration: Address, metadata_registration: Address) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocateOutcome {
    Resolved(Strategy),
    /// Every heuristic missed; both addresses must come from the operator
    NeedsManualInput,
}

pub struct RegistrationLocator {
    host: HostPlatform,
    state: LocatorState,
}

impl RegistrationLocator {
    pub fn new(host: HostPlatform) -> Self {
        Self { host, state: LocatorState::Unresolved }
    }

    pub fn state(&self) -> LocatorState {
        self.state
    }

    /// Run the heuristics, stopping at the first that succeeds
    pub fn locate<S>(&mut self, image: &mut S, counts: &SearchCounts) -> Result<LocateOutcome>
    where
        S: RegistrationSearch + ?Sized,
    {
        if self.state != LocatorState::Unresolved {
            return Err(Error::invalid_input(format!(
                "Locator already ran (state {:?})",
                self.state
            )));
        }

        let outcome = self.run(image, counts);
        if let Err(e) = &outcome {
            error!("Registration search failed: {}", e);
            self.state = LocatorState::Failed;
        }
        outcome
    }

    fn run<S>(&mut self, image: &mut S, counts: &SearchCounts) -> Result<LocateOutcome>
    where
        S: RegistrationSearch + ?Sized,
    {
        info!("Searching...");

        let found = image.plus_search(counts)?;
        self.state = LocatorState::PlusSearchAttempted;
        if found {
            return Ok(self.resolve(Strategy::PlusSearch));
        }

        if self.host == HostPlatform::Windows && image.format() == BinaryFormat::PE {
            return Err(Error::UnsupportedRecoveryPath(
                "loading the PE image through the host loader".to_string(),
            ));
        }

        let found = image.search()?;
        self.state = LocatorState::SearchAttempted;
        if found {
            return Ok(self.resolve(Strategy::Search));
        }

        let found = image.symbol_search()?;
        self.state = LocatorState::SymbolSearchAttempted;
        if found {
            return Ok(self.resolve(Strategy::SymbolSearch));
        }

        error!("Can't use auto mode to process file, try manual mode.");
        self.state = LocatorState::ManualInput;
        Ok(LocateOutcome::NeedsManualInput)
    }

    fn resolve(&mut self, strategy: Strategy) -> LocateOutcome {
        info!("Registrations found by {:?}", strategy);
        self.state = LocatorState::Resolved(strategy);
        LocateOutcome::Resolved(strategy)
    }

    /// Feed operator-supplied addresses to the image. Accepted without any
    /// plausibility check.
    pub fn supply_manual<S>(
        &mut self,
        image: &mut S,
        code_registration: Address,
        metadata_registration: Address,
    ) -> Result<Strategy>
    where
        S: RegistrationSearch + ?Sized,
    {
        if self.state != LocatorState::ManualInput {
            return Err(Error::invalid_input(format!(
                "Manual addresses are only accepted after every search missed (state {:?})",
                self.state
            )));
        }

        if let Err(e) = image.init(code_registration, metadata_registration) {
            self.state = LocatorState::Failed;
            return Err(e);
        }
        self.resolve(Strategy::Manual);
        Ok(Strategy::Manual)
    }
}
