use hashbrown::HashMap;

use crate::model::VaccineStock;

use super::{
    coordinator::{DoseConsume, DoseStore},
    store::StoreError,
};

/// Per-vaccine dose counts.
#[derive(Debug, Default, Clone)]
pub struct DoseLedger {
    stock: HashMap<String, u32>,
}

impl DoseLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the vaccine with `n` doses or adds `n` to it. Returns the new count.
    pub fn add_doses(&mut self, vaccine: &str, n: i64) -> Result<u32, StoreError> {
        if vaccine.trim().is_empty() {
            return Err(StoreError::Validation("vaccine name must not be empty".to_string()));
        }
        if n < 0 {
            return Err(StoreError::Validation(format!("dose count must not be negative: {n}")));
        }
        let added = u32::try_from(n)
            .map_err(|_| StoreError::Validation(format!("dose count too large: {n}")))?;

        let current = self.stock.get(vaccine).copied().unwrap_or(0);
        let next = current
            .checked_add(added)
            .ok_or_else(|| StoreError::Validation(format!("dose count overflow for {vaccine}")))?;
        self.stock.insert(vaccine.to_string(), next);
        Ok(next)
    }

    /// Decrements by one when stock is positive.
    pub fn try_consume_one(&mut self, vaccine: &str) -> DoseConsume {
        match self.stock.get_mut(vaccine) {
            None => DoseConsume::UnknownVaccine,
            Some(0) => DoseConsume::Exhausted,
            Some(doses) => {
                *doses -= 1;
                DoseConsume::Consumed
            }
        }
    }

    /// Undoes an [`Self::add_doses`] of `added`. With `created`, the vaccine
    /// is forgotten again.
    pub fn take_back(&mut self, vaccine: &str, added: u32, created: bool) {
        if created {
            self.stock.remove(vaccine);
        } else if let Some(doses) = self.stock.get_mut(vaccine) {
            *doses = doses.saturating_sub(added);
        }
    }

    /// Gives back one dose taken by [`Self::try_consume_one`].
    pub fn restore_one(&mut self, vaccine: &str) {
        if let Some(doses) = self.stock.get_mut(vaccine) {
            *doses = doses.saturating_add(1);
        }
    }

    /// Current count, or `None` for a vaccine never stocked.
    pub fn doses(&self, vaccine: &str) -> Option<u32> {
        self.stock.get(vaccine).copied()
    }

    /// Every known vaccine, ascending by name.
    pub fn stocks(&self) -> Vec<VaccineStock> {
        let mut out: Vec<VaccineStock> = self
            .stock
            .iter()
            .map(|(name, doses)| VaccineStock {
                name: name.clone(),
                doses: *doses,
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Vaccines with at least one dose, ascending by name.
    pub fn in_stock(&self) -> Vec<VaccineStock> {
        self.stocks().into_iter().filter(|s| s.doses > 0).collect()
    }
}

impl DoseStore for DoseLedger {
    fn try_consume_one(&mut self, vaccine: &str) -> DoseConsume {
        DoseLedger::try_consume_one(self, vaccine)
    }

    fn restore_one(&mut self, vaccine: &str) {
        DoseLedger::restore_one(self, vaccine);
    }
}
