//! Power control pass-through.

use std::sync::Arc;

use tracing::info;

use crate::platform::{Platform, PlatformError, PowerAction};

pub struct PowerControl {
    platform: Arc<dyn Platform>,
}

impl PowerControl {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self { platform }
    }

    pub fn request(&self, action: PowerAction) -> Result<(), PlatformError> {
        info!(?action, "power action requested");
        self.platform.power_action(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::headless::HeadlessPlatform;

    #[test]
    fn requests_reach_the_platform() {
        let platform = Arc::new(HeadlessPlatform::new());
        let power = PowerControl::new(platform.clone());
        power.request(PowerAction::Restart).unwrap();
        power.request(PowerAction::Shutdown).unwrap();
        assert_eq!(
            platform.power_requests(),
            vec![PowerAction::Restart, PowerAction::Shutdown]
        );
    }
}
