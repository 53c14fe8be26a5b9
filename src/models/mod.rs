pub mod box_break;
pub mod expense;
pub mod grading;
pub mod inventory;
pub mod location;
pub mod product;
pub mod purchase;
pub mod rate;
pub mod sale;
pub mod stream;
pub mod user;

pub use box_break::{BoxBreakOutputDisplay, BoxBreakSummary, BreakOutput};
pub use expense::{Expense, ExpenseCategory, ExpenseDisplay};
pub use grading::{GradingItem, GradingItemDisplay, GradingSubmission, GradingSummary};
pub use inventory::{MovementDisplay, MovementType, StockRow, MOVEMENT_DISPLAY_SQL};
pub use location::Location;
pub use product::Product;
pub use purchase::{Purchase, PurchaseItem, PurchaseItemDisplay, PurchaseSummary};
pub use rate::ExchangeRate;
pub use sale::{PricedLine, Sale, SaleItem, SaleItemDisplay, SaleSummary, SaleTotals};
pub use stream::{Stream, StreamLine, StreamReconciliation, StreamSummary};
pub use user::{Role, User, UserDisplay};
