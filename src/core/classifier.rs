/*!
 * Per-pixel surface classification
 *
 * The random forest is trained offline and exported as JSON:
 *
 * ```json
 * {"n_features": 9, "classes": [1, 2, 3, 4, 5, 6],
 *  "trees": [{"nodes": [{"feature": 2, "threshold": 0.41, "left": 1, "right": 2},
 *                       {"value": [0, 0, 0, 12, 0, 0]},
 *                       {"value": [30, 0, 0, 0, 0, 0]}]}]}
 * ```
 *
 * A split sends a sample left when `x[feature] <= threshold`. Leaf values are
 * per-class weights (sample counts or fractions). Prediction averages the
 * normalised leaf distributions over trees and takes the first class with the
 * highest mean probability.
 */

use crate::core::features::FeatureGrid;
use crate::types::{BoolMask, ClassGrid, IceSurfError, IceSurfResult, Sentinel2Band, SurfaceClass, UNCLASSIFIED};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Zip};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A model mapping rows of band reflectances to surface class labels
pub trait PixelClassifier: Send + Sync {
    /// Number of columns every sample row must have
    fn n_features(&self) -> usize;

    /// One label per row of `samples`
    fn predict(&self, samples: ArrayView2<'_, f32>) -> IceSurfResult<Array1<u8>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TreeNode {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        value: Vec<f64>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    /// Root first; every child index is greater than its parent's
    pub nodes: Vec<TreeNode>,
}

impl DecisionTree {
    fn leaf_for(&self, sample: ArrayView1<'_, f32>) -> &[f64] {
        let mut index = 0;
        loop {
            match &self.nodes[index] {
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    index = if f64::from(sample[*feature]) <= *threshold {
                        *left
                    } else {
                        *right
                    };
                }
                TreeNode::Leaf { value } => return value,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForestModel {
    pub n_features: usize,
    /// Label of each leaf value column
    pub classes: Vec<u8>,
    pub trees: Vec<DecisionTree>,
}

impl RandomForestModel {
    pub fn from_file<P: AsRef<Path>>(path: P) -> IceSurfResult<Self> {
        log::info!("Loading classifier from {}", path.as_ref().display());
        let content = std::fs::read_to_string(path.as_ref())?;
        let model = Self::from_json(&content)?;
        log::info!(
            "Random forest with {} trees, {} features, classes {:?}",
            model.trees.len(),
            model.n_features,
            model.classes
        );
        Ok(model)
    }

    pub fn from_json(json: &str) -> IceSurfResult<Self> {
        let model: RandomForestModel = serde_json::from_str(json)?;
        model.validate()?;
        Ok(model)
    }

    /// Reject documents that could index out of bounds or loop
    pub fn validate(&self) -> IceSurfResult<()> {
        let invalid = |msg: String| Err(IceSurfError::Classifier(msg));

        if self.n_features == 0 {
            return invalid("Model has no features".to_string());
        }
        if self.classes.is_empty() {
            return invalid("Model has no classes".to_string());
        }
        if self.trees.is_empty() {
            return invalid("Model has no trees".to_string());
        }

        for (t, tree) in self.trees.iter().enumerate() {
            if tree.nodes.is_empty() {
                return invalid(format!("Tree {} has no nodes", t));
            }
            for (i, node) in tree.nodes.iter().enumerate() {
                match node {
                    TreeNode::Split {
                        feature,
                        threshold,
                        left,
                        right,
                    } => {
                        if *feature >= self.n_features {
                            return invalid(format!(
                                "Tree {} node {} splits on feature {} of {}",
                                t, i, feature, self.n_features
                            ));
                        }
                        if threshold.is_nan() {
                            return invalid(format!("Tree {} node {} has a NaN threshold", t, i));
                        }
                        for child in [left, right] {
                            if *child <= i || *child >= tree.nodes.len() {
                                return invalid(format!(
                                    "Tree {} node {} has invalid child {}",
                                    t, i, child
                                ));
                            }
                        }
                    }
                    TreeNode::Leaf { value } => {
                        if value.len() != self.classes.len() {
                            return invalid(format!(
                                "Tree {} leaf {} has {} values for {} classes",
                                t,
                                i,
                                value.len(),
                                self.classes.len()
                            ));
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Mean class probabilities of one sample
    pub fn predict_proba(&self, sample: ArrayView1<'_, f32>) -> Vec<f64> {
        let mut proba = vec![0.0; self.classes.len()];
        for tree in &self.trees {
            let leaf = tree.leaf_for(sample);
            let total: f64 = leaf.iter().sum();
            if total > 0.0 {
                for (p, v) in proba.iter_mut().zip(leaf) {
                    *p += v / total;
                }
            }
        }

        let n_trees = self.trees.len() as f64;
        proba.iter_mut().for_each(|p| *p /= n_trees);
        proba
    }

    pub fn predict_one(&self, sample: ArrayView1<'_, f32>) -> u8 {
        let proba = self.predict_proba(sample);
        let mut best = 0;
        for (i, p) in proba.iter().enumerate() {
            if *p > proba[best] {
                best = i;
            }
        }
        self.classes[best]
    }
}

impl PixelClassifier for RandomForestModel {
    fn n_features(&self) -> usize {
        self.n_features
    }

    fn predict(&self, samples: ArrayView2<'_, f32>) -> IceSurfResult<Array1<u8>> {
        if samples.ncols() != self.n_features {
            return Err(IceSurfError::Classifier(format!(
                "Samples have {} features, model expects {}",
                samples.ncols(),
                self.n_features
            )));
        }

        let mut labels = Array1::<u8>::zeros(samples.nrows());

        #[cfg(feature = "parallel")]
        Zip::from(&mut labels)
            .and(samples.rows())
            .par_for_each(|label, row| *label = self.predict_one(row));

        #[cfg(not(feature = "parallel"))]
        Zip::from(&mut labels)
            .and(samples.rows())
            .for_each(|label, row| *label = self.predict_one(row));

        Ok(labels)
    }
}

/// Flattens a feature grid into samples, classifies them and scatters the
/// labels back onto the grid
pub struct ClassifierAdapter {
    classifier: Box<dyn PixelClassifier>,
}

impl ClassifierAdapter {
    pub fn new(classifier: Box<dyn PixelClassifier>) -> IceSurfResult<Self> {
        let expected = Sentinel2Band::FEATURE_ORDER.len();
        if classifier.n_features() != expected {
            return Err(IceSurfError::Classifier(format!(
                "Classifier expects {} features, scenes provide {}",
                classifier.n_features(),
                expected
            )));
        }
        Ok(Self { classifier })
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> IceSurfResult<Self> {
        Self::new(Box::new(RandomForestModel::from_file(path)?))
    }

    /// Class label of every pixel; pixels outside `valid` (when given) are
    /// left unclassified
    pub fn classify(&self, features: &FeatureGrid, valid: Option<&BoolMask>) -> IceSurfResult<ClassGrid> {
        let (rows, cols) = features.shape();
        let (samples, pixels) = features.sample_table(valid)?;
        log::info!("Classifying {} of {} pixels", pixels.len(), rows * cols);

        let labels = if pixels.is_empty() {
            Array1::zeros(0)
        } else {
            self.classifier.predict(samples.view())?
        };
        if labels.len() != pixels.len() {
            return Err(IceSurfError::Classifier(format!(
                "Classifier returned {} labels for {} samples",
                labels.len(),
                pixels.len()
            )));
        }
        if let Some(bad) = labels.iter().find(|l| SurfaceClass::from_label(**l).is_none()) {
            return Err(IceSurfError::Classifier(format!(
                "Classifier produced unknown label {}",
                bad
            )));
        }

        let mut grid = Array2::from_elem((rows, cols), UNCLASSIFIED);
        for (&pixel, &label) in pixels.iter().zip(labels.iter()) {
            grid[[pixel / cols, pixel % cols]] = label;
        }
        Ok(grid)
    }
}
