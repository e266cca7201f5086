//! Label vocabulary of the detection model.

use std::collections::HashSet;

/// COCO class names, the vocabulary of the stock YOLO weights
pub const COCO_CLASSES: &[&str] = &[
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat",
    "dog", "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack",
    "umbrella", "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball",
    "kite", "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket",
    "bottle", "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple",
    "sandwich", "orange", "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair",
    "couch", "potted plant", "bed", "dining table", "toilet", "tv", "laptop", "mouse",
    "remote", "keyboard", "cell phone", "microwave", "oven", "toaster", "sink", "refrigerator",
    "book", "clock", "vase", "scissors", "teddy bear", "hair drier", "toothbrush",
];

/// Fixed set of labels a detector can emit.
#[derive(Debug, Clone)]
pub struct LabelVocabulary {
    labels: Vec<String>,
    lookup: HashSet<String>,
}

impl LabelVocabulary {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ordered = Vec::new();
        let mut lookup = HashSet::new();
        for label in labels {
            let label: String = label.into();
            let label = label.trim().to_string();
            if !label.is_empty() && lookup.insert(label.clone()) {
                ordered.push(label);
            }
        }
        Self {
            labels: ordered,
            lookup,
        }
    }

    pub fn coco() -> Self {
        Self::new(COCO_CLASSES.iter().copied())
    }

    pub fn contains(&self, label: &str) -> bool {
        self.lookup.contains(label)
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

impl Default for LabelVocabulary {
    fn default() -> Self {
        Self::coco()
    }
}
