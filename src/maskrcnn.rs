use std::{path::PathBuf, time::Instant};

use image::DynamicImage;
use ndarray::{Array1, Array2, Array3, ArrayView, ArrayViewD, Axis, Dimension, Ix1, Ix2, Ix4};
use ort::{inputs, ExecutionProviderDispatch, GraphOptimizationLevel, Session, SessionOutputs};
use tracing::instrument;

use crate::{util::to_chw_tensor, Error, ExecutionProvider, RawPrediction, Result};

const BOXES_OUTPUT: &str = "boxes";
const LABELS_OUTPUT: &str = "labels";
const SCORES_OUTPUT: &str = "scores";
const MASKS_OUTPUT: &str = "masks";

/// Anything that maps an image to raw instance-segmentation output.
pub trait InstanceSegmenter {
    fn predict(&self, image: &DynamicImage) -> Result<RawPrediction>;
}

/// Mask R-CNN exported to ONNX with a single `[3, H, W]` input and the
/// `boxes`/`labels`/`scores`/`masks` outputs.
pub struct MaskRcnn {
    session: Session,
    input_name: String,
}

#[cfg(feature = "tensorrt")]
fn setup_tensorrt(cache_path: PathBuf) -> ExecutionProviderDispatch {
    use ort::TensorRTExecutionProvider;

    TensorRTExecutionProvider::default()
        .with_engine_cache(true)
        .with_engine_cache_path(cache_path.to_string_lossy())
        .with_timing_cache(true)
        .with_builder_optimization_level(5)
        .build()
}

#[cfg(feature = "cuda")]
fn setup_cuda() -> ExecutionProviderDispatch {
    use ort::CUDAExecutionProvider;

    CUDAExecutionProvider::default().build()
}

#[cfg(feature = "coreml")]
fn setup_coreml() -> ExecutionProviderDispatch {
    use ort::CoreMLExecutionProvider;

    CoreMLExecutionProvider::default().build()
}

#[cfg(feature = "directml")]
fn setup_directml() -> ExecutionProviderDispatch {
    use ort::DirectMLExecutionProvider;

    DirectMLExecutionProvider::default().build()
}

impl MaskRcnn {
    #[instrument(level = "debug")]
    pub fn init(
        path: PathBuf,
        input_name: String,
        num_threads: usize,
        execution_providers: &[ExecutionProvider],
        cache_path: Option<PathBuf>,
    ) -> Result<Self> {
        #[cfg(feature = "directml")]
        let parallel = !execution_providers.contains(&ExecutionProvider::DirectML);
        #[cfg(not(feature = "directml"))]
        let parallel = true;

        let execution_providers = execution_providers.iter().filter_map(
            |provider| -> Option<ExecutionProviderDispatch> {
                match provider {
                    ExecutionProvider::Default => None,
                    #[cfg(feature = "tensorrt")]
                    ExecutionProvider::TensorRT => Some(setup_tensorrt(
                        cache_path.clone().unwrap_or_else(|| {
                            path.parent()
                                .map(|it| it.join(".cache"))
                                .unwrap_or_else(|| PathBuf::from(".cache"))
                        }),
                    )),
                    #[cfg(feature = "coreml")]
                    ExecutionProvider::CoreML => Some(setup_coreml()),
                    #[cfg(feature = "cuda")]
                    ExecutionProvider::Cuda => Some(setup_cuda()),
                    #[cfg(feature = "directml")]
                    ExecutionProvider::DirectML => Some(setup_directml()),
                }
            },
        );
        #[cfg(not(feature = "tensorrt"))]
        let _ = &cache_path;

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_memory_pattern(parallel)?
            .with_parallel_execution(parallel)?
            .with_inter_threads(num_threads)?
            .with_intra_threads(num_threads)?
            .with_execution_providers(execution_providers)?
            .commit_from_file(path)?;

        log::debug!("Mask R-CNN session inputs: {:?}", session.inputs);
        log::debug!("Mask R-CNN session outputs: {:?}", session.outputs);

        Ok(Self {
            session,
            input_name,
        })
    }
}

impl InstanceSegmenter for MaskRcnn {
    #[instrument(skip(self, image), level = "debug")]
    fn predict(&self, image: &DynamicImage) -> Result<RawPrediction> {
        // the exported network normalizes internally, it only expects values in [0, 1]
        let input_values = to_chw_tensor(image);
        let inputs = inputs![self.input_name.as_str() => input_values]?;

        let start = Instant::now();
        let outputs = self.session.run(inputs)?;
        log::info!("Inference+NMS time: {:?}", start.elapsed());

        parse_outputs(&outputs)
    }
}

fn output<'a>(outputs: &'a SessionOutputs, name: &str) -> Result<&'a ort::DynValue> {
    outputs
        .get(name)
        .ok_or_else(|| Error::malformed(format!("missing `{name}` output")))
}

fn shaped<'a, T, D: Dimension>(
    view: ArrayViewD<'a, T>,
    name: &str,
) -> Result<ArrayView<'a, T, D>> {
    view.into_dimensionality::<D>()
        .map_err(|e| Error::malformed(format!("`{name}` has unexpected shape: {e}")))
}

#[instrument(skip(outputs), level = "trace")]
fn parse_outputs(outputs: &SessionOutputs) -> Result<RawPrediction> {
    let boxes = output(outputs, BOXES_OUTPUT)?.try_extract_tensor::<f32>()?;
    let labels = output(outputs, LABELS_OUTPUT)?.try_extract_tensor::<i64>()?;
    let scores = output(outputs, SCORES_OUTPUT)?.try_extract_tensor::<f32>()?;
    let masks = output(outputs, MASKS_OUTPUT)?.try_extract_tensor::<f32>()?;

    let boxes: Array2<f32> = shaped::<_, Ix2>(boxes, BOXES_OUTPUT)?.to_owned();
    let labels: Array1<i64> = shaped::<_, Ix1>(labels, LABELS_OUTPUT)?.to_owned();
    let scores: Array1<f32> = shaped::<_, Ix1>(scores, SCORES_OUTPUT)?.to_owned();
    let masks = shaped::<_, Ix4>(masks, MASKS_OUTPUT)?;
    if masks.len_of(Axis(1)) != 1 {
        return Err(Error::malformed(format!(
            "expected single-channel masks, got {:?}",
            masks.dim()
        )));
    }
    // [N, 1, H, W] -> [N, H, W]
    let masks: Array3<f32> = masks.index_axis_move(Axis(1), 0).to_owned();

    log::trace!(
        "Raw prediction: {} instances, mask shape {:?}",
        scores.len(),
        masks.dim()
    );

    Ok(RawPrediction {
        boxes,
        labels,
        scores,
        masks,
    })
}
