//! Process-wide registry of named filters

use std::collections::{HashMap, VecDeque};
use std::sync::{OnceLock, RwLock};

use tracing::debug;

use crate::domain::model::Frame;
use crate::error::{TranscodeError, TranscodeResult};
use crate::filters::FrameFilter;

/// Builds a filter instance from its argument string
pub type FilterFactory = fn(&str) -> TranscodeResult<Box<dyn FrameFilter>>;

static REGISTRY: OnceLock<FilterRegistry> = OnceLock::new();

/// Name -> factory table, initialised once on first access
pub struct FilterRegistry {
    factories: RwLock<HashMap<String, FilterFactory>>,
}

impl FilterRegistry {
    /// The shared registry, with the built-in filters already registered
    pub fn global() -> &'static FilterRegistry {
        REGISTRY.get_or_init(|| {
            let registry = FilterRegistry {
                factories: RwLock::new(HashMap::new()),
            };
            registry.register("null", NullFilter::create);
            registry.register("delay", DelayFilter::create);
            debug!("Filter registry initialized");
            registry
        })
    }

    /// Register or replace a filter factory
    pub fn register(&self, name: &str, factory: FilterFactory) {
        let mut factories = self.factories.write().unwrap_or_else(|e| e.into_inner());
        factories.insert(name.to_string(), factory);
    }

    /// Instantiate a filter by name
    pub fn create(&self, name: &str, args: &str) -> TranscodeResult<Box<dyn FrameFilter>> {
        let factory = {
            let factories = self.factories.read().unwrap_or_else(|e| e.into_inner());
            factories.get(name).copied()
        };
        match factory {
            Some(factory) => factory(args),
            None => Err(TranscodeError::filter(format!("Unknown filter: {}", name))),
        }
    }

    /// Registered filter names in sorted order
    pub fn names(&self) -> Vec<String> {
        let factories = self.factories.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = factories.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Passes every frame through untouched
struct NullFilter;

impl NullFilter {
    fn create(_args: &str) -> TranscodeResult<Box<dyn FrameFilter>> {
        Ok(Box::new(NullFilter))
    }
}

impl FrameFilter for NullFilter {
    fn name(&self) -> &str {
        "null"
    }

    fn push(&mut self, frame: Frame) -> TranscodeResult<Vec<Frame>> {
        Ok(vec![frame])
    }

    fn flush(&mut self) -> TranscodeResult<Vec<Frame>> {
        Ok(Vec::new())
    }
}

/// Holds back the last `depth` frames until end of stream (look-ahead)
struct DelayFilter {
    depth: usize,
    pending: VecDeque<Frame>,
}

impl DelayFilter {
    fn create(args: &str) -> TranscodeResult<Box<dyn FrameFilter>> {
        let args = args.trim();
        let depth = if args.is_empty() {
            1
        } else {
            args.parse::<usize>()
                .map_err(|_| TranscodeError::filter(format!("Invalid delay depth: {}", args)))?
        };
        Ok(Box::new(DelayFilter {
            depth,
            pending: VecDeque::new(),
        }))
    }
}

impl FrameFilter for DelayFilter {
    fn name(&self) -> &str {
        "delay"
    }

    fn push(&mut self, frame: Frame) -> TranscodeResult<Vec<Frame>> {
        self.pending.push_back(frame);
        let mut ready = Vec::new();
        while self.pending.len() > self.depth {
            if let Some(frame) = self.pending.pop_front() {
                ready.push(frame);
            }
        }
        Ok(ready)
    }

    fn flush(&mut self) -> TranscodeResult<Vec<Frame>> {
        Ok(self.pending.drain(..).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{FrameFormat, Timebase};

    fn subtitle_frame(pts: i64) -> Frame {
        Frame::new(FrameFormat::Subtitle, Timebase::MILLISECONDS, vec![0u8]).with_pts(pts)
    }

    #[test]
    fn test_builtins_are_registered() {
        let names = FilterRegistry::global().names();
        assert!(names.contains(&"null".to_string()));
        assert!(names.contains(&"delay".to_string()));
    }

    #[test]
    fn test_unknown_filter_is_rejected() {
        let result = FilterRegistry::global().create("does-not-exist", "");
        assert!(matches!(result, Err(TranscodeError::FilterError { .. })));
    }

    #[test]
    fn test_delay_filter_holds_frames_until_flush() {
        let mut delay = FilterRegistry::global().create("delay", "2").unwrap();
        assert!(delay.push(subtitle_frame(0)).unwrap().is_empty());
        assert!(delay.push(subtitle_frame(1)).unwrap().is_empty());
        let released = delay.push(subtitle_frame(2)).unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].pts, Some(0));

        let rest = delay.flush().unwrap();
        assert_eq!(rest.iter().map(|f| f.pts).collect::<Vec<_>>(), vec![Some(1), Some(2)]);
    }

    #[test]
    fn test_delay_filter_rejects_bad_depth() {
        assert!(FilterRegistry::global().create("delay", "lots").is_err());
    }

    #[test]
    fn test_custom_filter_registration() {
        fn create(_args: &str) -> TranscodeResult<Box<dyn FrameFilter>> {
            NullFilter::create("")
        }
        FilterRegistry::global().register("custom-null", create);
        let filter = FilterRegistry::global().create("custom-null", "").unwrap();
        assert_eq!(filter.name(), "null");
    }
}
