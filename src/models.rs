use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Conv2d, Conv2dConfig, Linear, Module, VarBuilder, VarMap};

use crate::error::{Error, Result};

/// A model replica as the synchronizer sees it: a local forward pass and a
/// named parameter list.
pub trait ReplicaModel: Send + Sync {
    /// Runs the forward pass in `dtype` and returns f32 logits.
    fn forward(&self, input: &Tensor, dtype: DType) -> Result<Tensor>;
    fn varmap(&self) -> &VarMap;
    fn name(&self) -> &str;

    fn named_parameters(&self) -> Result<Vec<(String, Var)>> {
        named_vars(self.varmap())
    }

    fn parameter_count(&self) -> Result<usize> {
        Ok(self
            .named_parameters()?
            .iter()
            .map(|(_, var)| var.as_tensor().elem_count())
            .sum())
    }
}

/// Variables sorted by name, so every rank walks them in the same order.
pub fn named_vars(varmap: &VarMap) -> Result<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| Error::Candle(candle_core::Error::Msg("variable map lock poisoned".into())))?;
    let mut vars: Vec<(String, Var)> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSpec {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub num_classes: usize,
}

impl InputSpec {
    pub fn cifar10() -> Self {
        Self {
            channels: 3,
            height: 32,
            width: 32,
            num_classes: 10,
        }
    }

    pub fn features(&self) -> usize {
        self.channels * self.height * self.width
    }
}

// Autocast: master weights stay f32, compute happens in the requested dtype.
fn linear_as(layer: &Linear, x: &Tensor) -> Result<Tensor> {
    let dtype = x.dtype();
    let weight = layer.weight().to_dtype(dtype)?;
    let bias = layer.bias().map(|b| b.to_dtype(dtype)).transpose()?;
    Ok(Linear::new(weight, bias).forward(x)?)
}

fn conv_as(layer: &Conv2d, x: &Tensor) -> Result<Tensor> {
    let dtype = x.dtype();
    let weight = layer.weight().to_dtype(dtype)?;
    let bias = layer.bias().map(|b| b.to_dtype(dtype)).transpose()?;
    Ok(Conv2d::new(weight, bias, layer.config().clone()).forward(x)?)
}

/// Two conv blocks and a classifier head.
pub struct ConvNet {
    var_map: VarMap,
    conv1: Conv2d,
    conv2: Conv2d,
    fc1: Linear,
    fc2: Linear,
    name: String,
}

impl ConvNet {
    pub fn new(spec: InputSpec, device: &Device) -> Result<Self> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);
        let same = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };

        let conv1 = candle_nn::conv2d(spec.channels, 16, 3, same, vb.pp("conv1"))?;
        let conv2 = candle_nn::conv2d(16, 32, 3, same, vb.pp("conv2"))?;
        let pooled = 32 * (spec.height / 4) * (spec.width / 4);
        let fc1 = candle_nn::linear(pooled, 128, vb.pp("fc1"))?;
        let fc2 = candle_nn::linear(128, spec.num_classes, vb.pp("fc2"))?;

        Ok(Self {
            var_map,
            conv1,
            conv2,
            fc1,
            fc2,
            name: "convnet".to_string(),
        })
    }
}

impl ReplicaModel for ConvNet {
    fn forward(&self, input: &Tensor, dtype: DType) -> Result<Tensor> {
        let x = input.to_dtype(dtype)?;
        let x = conv_as(&self.conv1, &x)?.relu()?.max_pool2d(2)?;
        let x = conv_as(&self.conv2, &x)?.relu()?.max_pool2d(2)?;
        let x = x.flatten_from(1)?;
        let x = linear_as(&self.fc1, &x)?.relu()?;
        let logits = linear_as(&self.fc2, &x)?;
        Ok(logits.to_dtype(DType::F32)?)
    }

    fn varmap(&self) -> &VarMap {
        &self.var_map
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Fully connected classifier over flattened inputs.
pub struct Mlp {
    var_map: VarMap,
    layers: Vec<Linear>,
    name: String,
}

impl Mlp {
    pub fn new(in_features: usize, hidden: &[usize], num_classes: usize, device: &Device) -> Result<Self> {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);

        let mut layers = Vec::with_capacity(hidden.len() + 1);
        let mut width = in_features;
        for (i, &h) in hidden.iter().chain(std::iter::once(&num_classes)).enumerate() {
            layers.push(candle_nn::linear(width, h, vb.pp(format!("layer_{}", i)))?);
            width = h;
        }

        Ok(Self {
            var_map,
            layers,
            name: "mlp".to_string(),
        })
    }
}

impl ReplicaModel for Mlp {
    fn forward(&self, input: &Tensor, dtype: DType) -> Result<Tensor> {
        let mut x = input.to_dtype(dtype)?.flatten_from(1)?;
        let last = self.layers.len() - 1;
        for (i, layer) in self.layers.iter().enumerate() {
            x = linear_as(layer, &x)?;
            if i < last {
                x = x.relu()?;
            }
        }
        Ok(x.to_dtype(DType::F32)?)
    }

    fn varmap(&self) -> &VarMap {
        &self.var_map
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// Factory function to create models
pub fn create_model(model_type: &str, spec: InputSpec, device: &Device) -> Result<Box<dyn ReplicaModel>> {
    match model_type {
        "convnet" => Ok(Box::new(ConvNet::new(spec, device)?)),
        "mlp" => Ok(Box::new(Mlp::new(spec.features(), &[256], spec.num_classes, device)?)),
        _ => Err(Error::Config(format!("Unknown model type: {}", model_type))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convnet_produces_class_logits() {
        let spec = InputSpec::cifar10();
        let model = ConvNet::new(spec, &Device::Cpu).unwrap();
        let input = Tensor::zeros((2, 3, 32, 32), DType::F32, &Device::Cpu).unwrap();
        let logits = model.forward(&input, DType::F32).unwrap();
        assert_eq!(logits.dims(), &[2, 10]);
        assert_eq!(logits.dtype(), DType::F32);
    }

    #[test]
    fn parameters_are_sorted_by_name() {
        let model = Mlp::new(12, &[8, 4], 3, &Device::Cpu).unwrap();
        let names: Vec<String> = model.named_parameters().unwrap().into_iter().map(|(n, _)| n).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert_eq!(names.len(), 6);
        assert_eq!(model.parameter_count().unwrap(), 12 * 8 + 8 + 8 * 4 + 4 + 4 * 3 + 3);
    }

    #[test]
    fn unknown_model_type_is_rejected() {
        let err = create_model("resnet152", InputSpec::cifar10(), &Device::Cpu).err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }
}
