use crate::entities::order_item;
use crate::errors::ServiceError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, Mul};

/// Exact monetary amount in the workshop's single currency.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);

    pub fn new(amount: Decimal) -> Self {
        Self(amount)
    }

    /// Rejects negative amounts; prices and costs are never below zero.
    pub fn non_negative(amount: Decimal) -> Result<Self, ServiceError> {
        if amount.is_sign_negative() && !amount.is_zero() {
            return Err(ServiceError::BadRequest(format!(
                "Amount must not be negative, got {}",
                amount
            )));
        }
        Ok(Self(amount))
    }

    pub fn amount(&self) -> Decimal {
        self.0
    }
}

impl From<Decimal> for Money {
    fn from(amount: Decimal) -> Self {
        Self(amount)
    }
}

impl From<Money> for Decimal {
    fn from(money: Money) -> Self {
        money.0
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl Mul<Quantity> for Money {
    type Output = Money;

    fn mul(self, rhs: Quantity) -> Money {
        Money(self.0 * Decimal::from(rhs.0))
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, Add::add)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

/// Positive count of units on a line item or a stock movement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub struct Quantity(i32);

impl Quantity {
    pub const ONE: Quantity = Quantity(1);

    pub fn new(value: i32) -> Result<Self, ServiceError> {
        if value < 1 {
            return Err(ServiceError::BadRequest(format!(
                "Quantity must be a positive integer, got {}",
                value
            )));
        }
        Ok(Self(value))
    }

    pub fn get(&self) -> i32 {
        self.0
    }
}

impl TryFrom<i32> for Quantity {
    type Error = ServiceError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Quantity::new(value)
    }
}

impl From<Quantity> for i32 {
    fn from(quantity: Quantity) -> Self {
        quantity.0
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Price of one line: unit price times quantity.
pub fn line_total(unit_price: Decimal, quantity: i32) -> Money {
    Money(unit_price * Decimal::from(quantity))
}

/// Re-derives an order total from its full item set.
pub fn recompute_total<'a, I>(items: I) -> Money
where
    I: IntoIterator<Item = &'a order_item::Model>,
{
    items
        .into_iter()
        .map(|item| line_total(item.price, item.quantity))
        .sum()
}
