// Card Entity

use crate::domain::error::{DomainError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const MAX_ALIAS_LENGTH: usize = 64;
pub const MAX_NUMBER_LENGTH: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum CardType {
    Gold = 0,
    Silver = 1,
    Bronze = 2,
}

impl CardType {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(CardType::Gold),
            1 => Some(CardType::Silver),
            2 => Some(CardType::Bronze),
            _ => None,
        }
    }
}

/// A registered transit card; owns its import batches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Card {
    pub id: Uuid,
    pub user_id: Uuid,
    pub alias: String,
    pub number: String,
    pub card_type: CardType,
    pub expiry_date: NaiveDate,
    pub created_at: DateTime<Utc>,
}

fn validate(alias: &str, number: &str) -> Result<()> {
    if alias.trim().is_empty() {
        return Err(DomainError::Validation("Alias cannot be empty.".to_string()));
    }
    if alias.chars().count() > MAX_ALIAS_LENGTH {
        return Err(DomainError::Validation(format!(
            "Alias cannot exceed {} characters.",
            MAX_ALIAS_LENGTH
        )));
    }
    if number.trim().is_empty() {
        return Err(DomainError::Validation("Number cannot be empty.".to_string()));
    }
    if number.chars().count() > MAX_NUMBER_LENGTH {
        return Err(DomainError::Validation(format!(
            "Number cannot exceed {} characters.",
            MAX_NUMBER_LENGTH
        )));
    }
    Ok(())
}

impl Card {
    pub fn create(
        id: Uuid,
        user_id: Uuid,
        alias: impl Into<String>,
        number: impl Into<String>,
        card_type: CardType,
        expiry_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let alias = alias.into();
        let number = number.into();
        if user_id.is_nil() {
            return Err(DomainError::Validation("User ID cannot be empty.".to_string()));
        }
        validate(&alias, &number)?;

        Ok(Self {
            id,
            user_id,
            alias,
            number,
            card_type,
            expiry_date,
            created_at: now,
        })
    }

    pub fn update(
        &mut self,
        alias: impl Into<String>,
        number: impl Into<String>,
        card_type: CardType,
        expiry_date: NaiveDate,
    ) -> Result<()> {
        let alias = alias.into();
        let number = number.into();
        validate(&alias, &number)?;

        self.alias = alias;
        self.number = number;
        self.card_type = card_type;
        self.expiry_date = expiry_date;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_create_validates() {
        let owner = Uuid::now_v7();
        let card = Card::create(
            Uuid::now_v7(),
            owner,
            "Work",
            "1234",
            CardType::Gold,
            date(2030, 1, 1),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(card.user_id, owner);

        let long_alias = "a".repeat(MAX_ALIAS_LENGTH + 1);
        for (alias, number) in [("", "1"), ("ok", " "), (long_alias.as_str(), "1")] {
            let result = Card::create(
                Uuid::now_v7(),
                owner,
                alias,
                number,
                CardType::Silver,
                date(2030, 1, 1),
                Utc::now(),
            );
            assert!(matches!(result, Err(DomainError::Validation(_))));
        }
    }

    #[test]
    fn test_update_keeps_owner() {
        let owner = Uuid::now_v7();
        let mut card = Card::create(
            Uuid::now_v7(),
            owner,
            "Work",
            "1234",
            CardType::Gold,
            date(2030, 1, 1),
            Utc::now(),
        )
        .unwrap();

        card.update("Home", "5678", CardType::Bronze, date(2031, 6, 30))
            .unwrap();
        assert_eq!(card.alias, "Home");
        assert_eq!(card.card_type, CardType::Bronze);
        assert_eq!(card.user_id, owner);

        assert!(card
            .update("", "5678", CardType::Bronze, date(2031, 6, 30))
            .is_err());
        assert_eq!(card.alias, "Home");
    }

    #[test]
    fn test_card_type_values() {
        assert_eq!(CardType::from_i32(CardType::Bronze.as_i32()), Some(CardType::Bronze));
        assert_eq!(CardType::from_i32(9), None);
    }
}
