//! Built-in transform nodes

use ml_feed_core::{DataType, Layout, Tensor, TensorInfo};

use crate::error::{Error, Result};
use crate::node::{BuildContext, NodeKind, ParamContext, TransformNode};
use crate::params::{FloatParam, IntParam};

fn single_io<'i, 'o, 't>(
    kind: NodeKind,
    inputs: &'i [&'i Tensor],
    outputs: &'o mut [&'t mut Tensor],
) -> Result<(&'i Tensor, &'o mut Tensor)> {
    match (inputs, outputs) {
        ([input], [output]) => Ok((*input, &mut **output)),
        _ => Err(Error::Execution {
            node: kind.to_string(),
            reason: "expects exactly one input and one output".into(),
        }),
    }
}

fn same_shape(kind: NodeKind, inputs: &[&TensorInfo], outputs: &[&TensorInfo]) -> Result<()> {
    match (inputs, outputs) {
        ([input], [output]) if input.dims == output.dims && input.data_type == output.data_type => {
            Ok(())
        }
        ([_], [_]) => Err(Error::InvalidArgument(format!(
            "{kind} node needs matching input and output shapes"
        ))),
        _ => Err(Error::InvalidArgument(format!(
            "{kind} node expects exactly one input and one output"
        ))),
    }
}

/// Copies its input into its output
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyNode;

impl TransformNode for CopyNode {
    fn kind(&self) -> NodeKind {
        NodeKind::COPY
    }

    fn create(
        &mut self,
        _ctx: &BuildContext,
        inputs: &[&TensorInfo],
        outputs: &[&TensorInfo],
    ) -> Result<()> {
        match (inputs, outputs) {
            ([input], [output]) if input.data_size() == output.data_size() => Ok(()),
            _ => Err(Error::InvalidArgument(
                "copy node needs one input and one output of equal size".into(),
            )),
        }
    }

    fn execute(&mut self, inputs: &[&Tensor], outputs: &mut [&mut Tensor]) -> Result<()> {
        let (input, output) = single_io(self.kind(), inputs, outputs)?;
        output.buffer_mut().copy_from(input.buffer())?;
        Ok(())
    }
}

/// Scales every 8-bit value of a sample by a per-sample factor
#[derive(Debug, Clone)]
pub struct BrightnessNode {
    /// Distribution of the factor
    factor: FloatParam,

    /// Factors drawn for the current batch
    values: Vec<f32>,
}

impl BrightnessNode {
    /// Create a node drawing its factor from `factor`
    pub fn new(factor: FloatParam) -> Result<Self> {
        factor.validate()?;
        Ok(Self {
            factor,
            values: Vec::new(),
        })
    }
}

impl TransformNode for BrightnessNode {
    fn kind(&self) -> NodeKind {
        NodeKind::BRIGHTNESS
    }

    fn create(
        &mut self,
        ctx: &BuildContext,
        inputs: &[&TensorInfo],
        outputs: &[&TensorInfo],
    ) -> Result<()> {
        same_shape(self.kind(), inputs, outputs)?;
        if inputs[0].data_type != DataType::UInt8 {
            return Err(Error::InvalidArgument("brightness node works on u8 tensors".into()));
        }
        self.values = vec![1.0; ctx.batch_size];
        Ok(())
    }

    fn update_parameters(&mut self, ctx: &mut ParamContext<'_>) -> Result<()> {
        self.factor.renew(ctx.rng, ctx.batch_size, &mut self.values);
        Ok(())
    }

    fn parameters(&self) -> &[f32] {
        &self.values
    }

    fn execute(&mut self, inputs: &[&Tensor], outputs: &mut [&mut Tensor]) -> Result<()> {
        let (input, output) = single_io(self.kind(), inputs, outputs)?;
        let sample_size = input.info().sample_size();
        let src = input.buffer().as_bytes();
        let dst = output.buffer_mut().as_bytes_mut();

        for (i, (src, dst)) in src
            .chunks_exact(sample_size)
            .zip(dst.chunks_exact_mut(sample_size))
            .enumerate()
        {
            let factor = self.values.get(i).copied().unwrap_or(1.0);
            for (d, &s) in dst.iter_mut().zip(src) {
                // clamped to the u8 range before the cast
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let scaled = (f32::from(s) * factor).round().clamp(0.0, 255.0) as u8;
                *d = scaled;
            }
        }
        Ok(())
    }
}

/// Mirrors NHWC samples horizontally when their per-sample flag is set
#[derive(Debug, Clone)]
pub struct FlipNode {
    /// Distribution of the flag; non-zero flips
    flag: IntParam,

    /// Flags drawn for the current batch
    flags: Vec<i32>,

    /// Flags as floats, for metadata stages
    values: Vec<f32>,
}

impl FlipNode {
    /// Create a node drawing its per-sample flag from `flag`
    pub fn new(flag: IntParam) -> Result<Self> {
        flag.validate()?;
        Ok(Self {
            flag,
            flags: Vec::new(),
            values: Vec::new(),
        })
    }

    /// Flip every sample of every batch
    pub fn always() -> Self {
        Self {
            flag: IntParam::Fixed(1),
            flags: Vec::new(),
            values: Vec::new(),
        }
    }
}

impl Default for FlipNode {
    fn default() -> Self {
        Self {
            flag: IntParam::Choice(vec![0, 1]),
            flags: Vec::new(),
            values: Vec::new(),
        }
    }
}

impl TransformNode for FlipNode {
    fn kind(&self) -> NodeKind {
        NodeKind::FLIP
    }

    fn create(
        &mut self,
        ctx: &BuildContext,
        inputs: &[&TensorInfo],
        outputs: &[&TensorInfo],
    ) -> Result<()> {
        same_shape(self.kind(), inputs, outputs)?;
        if inputs[0].layout != Layout::Nhwc || inputs[0].dims.len() != 4 {
            return Err(Error::InvalidArgument("flip node expects NHWC tensors".into()));
        }
        self.flags = vec![0; ctx.batch_size];
        self.values = vec![0.0; ctx.batch_size];
        Ok(())
    }

    fn update_parameters(&mut self, ctx: &mut ParamContext<'_>) -> Result<()> {
        self.flag.renew(ctx.rng, ctx.batch_size, &mut self.flags);
        self.values.clear();
        self.values
            .extend(self.flags.iter().map(|&f| if f != 0 { 1.0 } else { 0.0 }));
        Ok(())
    }

    fn parameters(&self) -> &[f32] {
        &self.values
    }

    fn execute(&mut self, inputs: &[&Tensor], outputs: &mut [&mut Tensor]) -> Result<()> {
        let (input, output) = single_io(self.kind(), inputs, outputs)?;
        let dims = &input.info().dims;
        let (width, channels) = (dims[2], dims[3]);
        let row = width * channels;
        let sample_size = input.info().sample_size();
        let src = input.buffer().as_bytes();
        let dst = output.buffer_mut().as_bytes_mut();

        for (i, (src, dst)) in src
            .chunks_exact(sample_size)
            .zip(dst.chunks_exact_mut(sample_size))
            .enumerate()
        {
            if self.flags.get(i).copied().unwrap_or(0) == 0 {
                dst.copy_from_slice(src);
                continue;
            }
            for (src_row, dst_row) in src.chunks_exact(row).zip(dst.chunks_exact_mut(row)) {
                for (x, pixel) in src_row.chunks_exact(channels).enumerate() {
                    let target = (width - 1 - x) * channels;
                    dst_row[target..target + channels].copy_from_slice(pixel);
                }
            }
        }
        Ok(())
    }
}

type NodeFn = dyn FnMut(&[&Tensor], &mut [&mut Tensor]) -> Result<()> + Send;

/// A node backed by a closure
pub struct FnNode {
    /// Reported kind
    kind: NodeKind,

    /// The transform
    f: Box<NodeFn>,
}

impl FnNode {
    /// Wrap a closure as a node of the given kind
    pub fn new<F>(kind: NodeKind, f: F) -> Self
    where
        F: FnMut(&[&Tensor], &mut [&mut Tensor]) -> Result<()> + Send + 'static,
    {
        Self {
            kind,
            f: Box::new(f),
        }
    }
}

impl TransformNode for FnNode {
    fn kind(&self) -> NodeKind {
        self.kind
    }

    fn execute(&mut self, inputs: &[&Tensor], outputs: &mut [&mut Tensor]) -> Result<()> {
        (self.f)(inputs, outputs)
    }
}
