mod pipeline_test;
