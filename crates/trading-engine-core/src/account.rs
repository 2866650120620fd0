// File: src/account.rs
//
// Illustrative trading-account aggregate wired through the full spine:
// commands in, events out, a balance projection, and a balance query.
// Business aggregates beyond this one live outside the core.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::aggregate::{AggregateBase, AggregateRoot};
use crate::command::{Command, CommandHandler};
use crate::error::{EventError, EventResult};
use crate::event::{DomainEvent, EventEnvelope};
use crate::projection::Projection;
use crate::query::{Query, QueryHandler};
use crate::repository::AggregateRepository;

pub const ACCOUNT_KIND: &str = "account";

pub const ACCOUNT_OPENED: &str = "account_opened";
pub const FUNDS_DEPOSITED: &str = "funds_deposited";
pub const FUNDS_WITHDRAWN: &str = "funds_withdrawn";

pub const CREATE_ACCOUNT: &str = "create_account";
pub const DEPOSIT: &str = "deposit";
pub const WITHDRAW: &str = "withdraw";
pub const GET_BALANCE: &str = "get_balance";

/// Account lifecycle events, past tense, with static kind tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AccountEvent {
    AccountOpened { initial_balance: Decimal },
    FundsDeposited { amount: Decimal },
    FundsWithdrawn { amount: Decimal },
}

impl DomainEvent for AccountEvent {
    fn kind(&self) -> &'static str {
        match self {
            AccountEvent::AccountOpened { .. } => ACCOUNT_OPENED,
            AccountEvent::FundsDeposited { .. } => FUNDS_DEPOSITED,
            AccountEvent::FundsWithdrawn { .. } => FUNDS_WITHDRAWN,
        }
    }

    fn payload(&self) -> EventResult<serde_json::Value> {
        let fields = match self {
            AccountEvent::AccountOpened { initial_balance } => {
                serde_json::json!({ "initial_balance": initial_balance })
            }
            AccountEvent::FundsDeposited { amount } => serde_json::json!({ "amount": amount }),
            AccountEvent::FundsWithdrawn { amount } => serde_json::json!({ "amount": amount }),
        };
        Ok(fields)
    }

    fn from_payload(kind: &str, payload: &serde_json::Value) -> EventResult<Self> {
        fn field<T: serde::de::DeserializeOwned>(
            payload: &serde_json::Value,
            name: &str,
        ) -> EventResult<T> {
            serde_json::from_value(payload[name].clone()).map_err(|e| {
                EventError::DeserializationError {
                    message: format!("missing or invalid '{}': {}", name, e),
                }
            })
        }
        match kind {
            ACCOUNT_OPENED => Ok(AccountEvent::AccountOpened {
                initial_balance: field(payload, "initial_balance")?,
            }),
            FUNDS_DEPOSITED => Ok(AccountEvent::FundsDeposited {
                amount: field(payload, "amount")?,
            }),
            FUNDS_WITHDRAWN => Ok(AccountEvent::FundsWithdrawn {
                amount: field(payload, "amount")?,
            }),
            other => Err(EventError::DeserializationError {
                message: format!("unknown account event kind: {}", other),
            }),
        }
    }
}

/// A trading account: the consistency boundary for balance changes.
#[derive(Debug)]
pub struct TradingAccount {
    base: AggregateBase,
    balance: Decimal,
    opened: bool,
}

impl TradingAccount {
    /// Open a fresh account, recording the opening event.
    pub fn open(id: impl Into<String>, initial_balance: Decimal) -> EventResult<Self> {
        if initial_balance < Decimal::ZERO {
            return Err(EventError::domain("initial balance cannot be negative"));
        }
        let mut account = Self::new(id);
        account.record(AccountEvent::AccountOpened { initial_balance })?;
        Ok(account)
    }

    pub fn balance(&self) -> Decimal {
        self.balance
    }

    pub fn deposit(&mut self, amount: Decimal) -> EventResult<()> {
        if !self.opened {
            return Err(EventError::domain("account is not open"));
        }
        if amount <= Decimal::ZERO {
            return Err(EventError::domain("deposit amount must be positive"));
        }
        self.record(AccountEvent::FundsDeposited { amount })
    }

    pub fn withdraw(&mut self, amount: Decimal) -> EventResult<()> {
        if !self.opened {
            return Err(EventError::domain("account is not open"));
        }
        if amount <= Decimal::ZERO {
            return Err(EventError::domain("withdrawal amount must be positive"));
        }
        if amount > self.balance {
            return Err(EventError::domain("insufficient funds"));
        }
        self.record(AccountEvent::FundsWithdrawn { amount })
    }
}

impl AggregateRoot for TradingAccount {
    type Event = AccountEvent;
    const KIND: &'static str = ACCOUNT_KIND;

    fn new(id: impl Into<String>) -> Self {
        Self {
            base: AggregateBase::new(id),
            balance: Decimal::ZERO,
            opened: false,
        }
    }

    fn base(&self) -> &AggregateBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut AggregateBase {
        &mut self.base
    }

    fn apply(&mut self, event: &Self::Event) -> EventResult<()> {
        match event {
            AccountEvent::AccountOpened { initial_balance } => {
                self.balance = *initial_balance;
                self.opened = true;
            }
            AccountEvent::FundsDeposited { amount } => self.balance += amount,
            AccountEvent::FundsWithdrawn { amount } => self.balance -= amount,
        }
        Ok(())
    }

    fn snapshot_state(&self) -> EventResult<serde_json::Value> {
        Ok(serde_json::json!({
            "balance": self.balance,
            "opened": self.opened,
        }))
    }

    fn restore_state(&mut self, state: &serde_json::Value) -> EventResult<()> {
        self.balance = serde_json::from_value(state["balance"].clone())?;
        self.opened = state["opened"].as_bool().unwrap_or(false);
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct CreateAccountFields {
    id: String,
    initial_balance: Decimal,
}

#[derive(Debug, Deserialize)]
struct AmountFields {
    id: String,
    amount: Decimal,
}

/// Handles `create_account`: the aggregate must not already exist.
pub struct CreateAccountHandler {
    repository: Arc<AggregateRepository>,
}

impl CreateAccountHandler {
    pub fn new(repository: Arc<AggregateRepository>) -> Arc<Self> {
        Arc::new(Self { repository })
    }
}

#[async_trait]
impl CommandHandler for CreateAccountHandler {
    async fn handle(&self, command: Command) -> EventResult<()> {
        let fields: CreateAccountFields = command.fields_as()?;
        if self.repository.exists::<TradingAccount>(&fields.id).await? {
            return Err(EventError::domain(format!(
                "account {} already exists",
                fields.id
            )));
        }
        let mut account = TradingAccount::open(fields.id, fields.initial_balance)?;
        self.repository.save(&mut account).await
    }
}

/// Handles `deposit`: load, act, save. `ConcurrencyConflict` from the
/// save is the caller's retry signal.
pub struct DepositHandler {
    repository: Arc<AggregateRepository>,
}

impl DepositHandler {
    pub fn new(repository: Arc<AggregateRepository>) -> Arc<Self> {
        Arc::new(Self { repository })
    }
}

#[async_trait]
impl CommandHandler for DepositHandler {
    async fn handle(&self, command: Command) -> EventResult<()> {
        let fields: AmountFields = command.fields_as()?;
        let mut account: TradingAccount = self.repository.load(&fields.id).await?;
        account.deposit(fields.amount)?;
        self.repository.save(&mut account).await
    }
}

/// Handles `withdraw`; insufficient funds surfaces verbatim.
pub struct WithdrawHandler {
    repository: Arc<AggregateRepository>,
}

impl WithdrawHandler {
    pub fn new(repository: Arc<AggregateRepository>) -> Arc<Self> {
        Arc::new(Self { repository })
    }
}

#[async_trait]
impl CommandHandler for WithdrawHandler {
    async fn handle(&self, command: Command) -> EventResult<()> {
        let fields: AmountFields = command.fields_as()?;
        let mut account: TradingAccount = self.repository.load(&fields.id).await?;
        account.withdraw(fields.amount)?;
        self.repository.save(&mut account).await
    }
}

/// Balance read model keyed by account id.
pub struct BalanceProjection {
    balances: RwLock<HashMap<String, Decimal>>,
}

impl BalanceProjection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            balances: RwLock::new(HashMap::new()),
        })
    }

    pub async fn balance(&self, account_id: &str) -> Option<Decimal> {
        self.balances.read().await.get(account_id).copied()
    }

    pub async fn len(&self) -> usize {
        self.balances.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.balances.read().await.is_empty()
    }
}

#[async_trait]
impl Projection for BalanceProjection {
    fn name(&self) -> &str {
        "balances"
    }

    fn handled_kinds(&self) -> Vec<String> {
        vec![
            ACCOUNT_OPENED.to_string(),
            FUNDS_DEPOSITED.to_string(),
            FUNDS_WITHDRAWN.to_string(),
        ]
    }

    async fn apply(&self, event: &EventEnvelope) -> EventResult<()> {
        let account_event = AccountEvent::from_payload(&event.event_kind, &event.payload)?;
        let mut balances = self.balances.write().await;
        let balance = balances.entry(event.aggregate_id.clone()).or_insert(Decimal::ZERO);
        match account_event {
            AccountEvent::AccountOpened { initial_balance } => *balance = initial_balance,
            AccountEvent::FundsDeposited { amount } => *balance += amount,
            AccountEvent::FundsWithdrawn { amount } => *balance -= amount,
        }
        Ok(())
    }

    async fn reset(&self) -> EventResult<()> {
        self.balances.write().await.clear();
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct GetBalanceParams {
    id: String,
}

/// Serves `get_balance` from the balance projection.
pub struct GetBalanceHandler {
    projection: Arc<BalanceProjection>,
}

impl GetBalanceHandler {
    pub fn new(projection: Arc<BalanceProjection>) -> Arc<Self> {
        Arc::new(Self { projection })
    }
}

#[async_trait]
impl QueryHandler for GetBalanceHandler {
    async fn handle(&self, query: Query) -> EventResult<serde_json::Value> {
        let params: GetBalanceParams = query.params_as()?;
        let balance = self.projection.balance(&params.id).await.ok_or_else(|| {
            EventError::AggregateNotFound {
                aggregate_kind: ACCOUNT_KIND.to_string(),
                aggregate_id: params.id.clone(),
            }
        })?;
        Ok(serde_json::json!({ "id": params.id, "balance": balance }))
    }
}
