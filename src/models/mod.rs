pub mod alert;
pub mod attempt;
pub mod caregiver;
pub mod dose;
pub mod settings;

pub use alert::*;
pub use attempt::*;
pub use caregiver::*;
pub use dose::*;
pub use settings::*;
