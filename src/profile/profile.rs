use crate::profile::Setting;
use crate::protocol::Pipeline;
use crate::transform::{Transform, Wrapper};
use crate::util::limits::{DEFAULT_JITTER, DEFAULT_SLEEP, MEDIUM_LIMIT};
use std::sync::Arc;
use std::time::Duration;

/// Connection configuration shared by listeners and sessions
///
/// Zero or out-of-range values are replaced by defaults when read through the
/// accessors, so a `Profile::default()` is always usable.
#[derive(Debug, Clone, Default)]
pub struct Profile {
    sleep: Duration,
    jitter: u8,
    size: usize,
    wrapper: Option<Arc<dyn Wrapper>>,
    transform: Option<Arc<dyn Transform>>,
    setting: Setting,
}

impl Profile {
    pub fn builder() -> ProfileBuilder {
        ProfileBuilder::default()
    }

    /// Poll interval, `DEFAULT_SLEEP` when unset
    pub fn sleep(&self) -> Duration {
        if self.sleep.is_zero() {
            DEFAULT_SLEEP
        } else {
            self.sleep
        }
    }

    /// Jitter percentage, `DEFAULT_JITTER` when above 100
    pub fn jitter(&self) -> u8 {
        if self.jitter > 100 {
            DEFAULT_JITTER
        } else {
            self.jitter
        }
    }

    /// Queue capacity, `MEDIUM_LIMIT` when unset
    pub fn size(&self) -> usize {
        if self.size == 0 { MEDIUM_LIMIT } else { self.size }
    }

    pub fn wrapper(&self) -> Option<&Arc<dyn Wrapper>> {
        self.wrapper.as_ref()
    }

    pub fn transform(&self) -> Option<&Arc<dyn Transform>> {
        self.transform.as_ref()
    }

    pub fn setting(&self) -> &Setting {
        &self.setting
    }

    /// Encoding pipeline built from the Wrapper and Transform
    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(self.wrapper.clone(), self.transform.clone())
    }
}

/// Builder for [`Profile`]
#[derive(Debug, Clone, Default)]
pub struct ProfileBuilder {
    profile: Profile,
}

impl ProfileBuilder {
    pub fn sleep(mut self, sleep: Duration) -> Self {
        self.profile.sleep = sleep;
        self
    }

    pub fn jitter(mut self, jitter: u8) -> Self {
        self.profile.jitter = jitter;
        self
    }

    pub fn size(mut self, size: usize) -> Self {
        self.profile.size = size;
        self
    }

    pub fn wrapper(mut self, wrapper: Arc<dyn Wrapper>) -> Self {
        self.profile.wrapper = Some(wrapper);
        self
    }

    pub fn transform(mut self, transform: Arc<dyn Transform>) -> Self {
        self.profile.transform = Some(transform);
        self
    }

    pub fn setting(mut self, setting: Setting) -> Self {
        self.profile.setting = setting;
        self
    }

    pub fn build(self) -> Profile {
        self.profile
    }
}
