//! Layer configuration consumed when a projection is constructed.

use crate::algorithm::WorkspacePolicy;
use crate::error::{ConvError, Result};
use crate::shape::{ConvMode, Extent};

/// Declarative description of a convolution or deconvolution projection.
///
/// `channels` and `num_filters` are given the way the layer is configured: for a
/// transposed projection `channels` counts the channels of the (small) input and
/// `num_filters` those of the upsampled output.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvConfig {
    pub channels: usize,
    pub num_filters: usize,
    /// (height, width)
    pub kernel: (usize, usize),
    pub stride: (usize, usize),
    pub padding: (usize, usize),
    pub groups: usize,
    pub mode: ConvMode,
    /// Frame size used when the upstream argument carries no spatial information.
    pub fallback_frame: Extent,
    pub caffe_mode: bool,
    pub workspace_policy: WorkspacePolicy,
}

impl ConvConfig {
    /// A stride 1, unpadded, ungrouped convolution.
    pub fn new(channels: usize, num_filters: usize, kernel: (usize, usize)) -> Self {
        ConvConfig {
            channels,
            num_filters,
            kernel,
            stride: (1, 1),
            padding: (0, 0),
            groups: 1,
            mode: ConvMode::Convolution,
            fallback_frame: Extent::default(),
            caffe_mode: true,
            workspace_policy: WorkspacePolicy::Max,
        }
    }

    pub fn stride(mut self, height: usize, width: usize) -> Self {
        self.stride = (height, width);
        self
    }

    pub fn padding(mut self, height: usize, width: usize) -> Self {
        self.padding = (height, width);
        self
    }

    pub fn groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    /// Switches the projection to a transposed convolution.
    pub fn transposed(mut self) -> Self {
        self.mode = ConvMode::Transposed;
        self
    }

    pub fn fallback_frame(mut self, height: usize, width: usize) -> Self {
        self.fallback_frame = Extent::new(height, width);
        self
    }

    pub fn caffe_mode(mut self, caffe_mode: bool) -> Self {
        self.caffe_mode = caffe_mode;
        self
    }

    pub fn workspace_policy(mut self, policy: WorkspacePolicy) -> Self {
        self.workspace_policy = policy;
        self
    }
}

/// Validated, immutable parameters of one projection instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvParams {
    pub(crate) kernel: Extent,
    pub(crate) stride: Extent,
    pub(crate) padding: Extent,
    pub(crate) groups: usize,
    pub(crate) mode: ConvMode,
    pub(crate) caffe_mode: bool,
    pub(crate) config_channels: usize,
    pub(crate) config_num_filters: usize,
    pub(crate) fallback_frame: Extent,
    pub(crate) workspace_policy: WorkspacePolicy,
}

impl ConvParams {
    pub fn from_config(config: &ConvConfig) -> Result<Self> {
        let (kh, kw) = config.kernel;
        let (sh, sw) = config.stride;
        if kh == 0 || kw == 0 {
            return Err(ConvError::shape(format!("kernel {}x{} has a zero side", kh, kw)));
        }
        if sh == 0 || sw == 0 {
            return Err(ConvError::shape(format!("stride {}x{} has a zero side", sh, sw)));
        }
        if config.groups == 0 {
            return Err(ConvError::shape("group count must be positive"));
        }
        if config.channels == 0 || config.num_filters == 0 {
            return Err(ConvError::shape("channel and filter counts must be positive"));
        }
        if config.channels % config.groups != 0 || config.num_filters % config.groups != 0 {
            return Err(ConvError::shape(format!(
                "{} groups do not evenly divide {} channels and {} filters",
                config.groups, config.channels, config.num_filters
            )));
        }
        Ok(ConvParams {
            kernel: Extent::new(kh, kw),
            stride: Extent::new(sh, sw),
            padding: Extent::new(config.padding.0, config.padding.1),
            groups: config.groups,
            mode: config.mode,
            caffe_mode: config.caffe_mode,
            config_channels: config.channels,
            config_num_filters: config.num_filters,
            fallback_frame: config.fallback_frame,
            workspace_policy: config.workspace_policy,
        })
    }

    /// Channels of the image side, in convolution terms.
    pub fn channels(&self) -> usize {
        match self.mode {
            ConvMode::Convolution => self.config_channels,
            ConvMode::Transposed => self.config_num_filters,
        }
    }

    /// Filters producing the output side, in convolution terms.
    pub fn num_filters(&self) -> usize {
        match self.mode {
            ConvMode::Convolution => self.config_num_filters,
            ConvMode::Transposed => self.config_channels,
        }
    }

    pub fn groups(&self) -> usize {
        self.groups
    }

    pub fn mode(&self) -> ConvMode {
        self.mode
    }

    pub fn kernel(&self) -> Extent {
        self.kernel
    }

    pub fn stride(&self) -> Extent {
        self.stride
    }

    pub fn padding(&self) -> Extent {
        self.padding
    }

    pub fn workspace_policy(&self) -> WorkspacePolicy {
        self.workspace_policy
    }

    /// Shape of the whole weight: (filters, channels per group, kernel h, kernel w).
    pub fn filter_shape(&self) -> (usize, usize, usize, usize) {
        (
            self.num_filters(),
            self.channels() / self.groups,
            self.kernel.height,
            self.kernel.width,
        )
    }
}
